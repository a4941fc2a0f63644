//! Bot assembly, lifecycle management and the operator command surface

mod bot;
mod controller;

pub use bot::{HealthStatus, PerpGridBot};
pub use controller::BotController;
