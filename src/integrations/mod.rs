pub mod sheets;
pub mod webapp;
