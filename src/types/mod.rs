pub mod holdings;
pub mod money;
pub mod order;
pub mod ticker;
pub mod world;
