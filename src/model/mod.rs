pub mod brick;
pub mod tick;
