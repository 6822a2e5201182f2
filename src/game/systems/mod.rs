pub mod ai;
pub mod ai_registry;
pub mod items;
