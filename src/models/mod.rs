pub mod event;
pub mod expense;
pub mod token;
