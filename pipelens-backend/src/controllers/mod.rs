pub mod analytics;
pub mod health;
pub mod runs;
pub mod steps;
