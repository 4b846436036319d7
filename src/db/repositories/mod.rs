pub mod items;
pub mod logs;
