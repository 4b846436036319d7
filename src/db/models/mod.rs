pub mod item;
pub mod log_record;
pub mod value;

pub use item::ItemDescriptor;
pub use log_record::LogRecord;
pub use value::{Value, ValueKind};
