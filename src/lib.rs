// Soft real-time balance controller for a three-wheel ball-bot

pub mod config;
pub mod controller;
pub mod datalog;
pub mod kinematics;
pub mod messages;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod teleop;
pub mod transport;
