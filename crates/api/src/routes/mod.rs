pub mod health;
pub mod optimizer;
