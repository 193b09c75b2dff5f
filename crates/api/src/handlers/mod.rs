pub mod events;
pub mod optimizer;
