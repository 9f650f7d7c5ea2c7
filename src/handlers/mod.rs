mod health;

pub use health::{HealthResponse, health_check, not_found};
