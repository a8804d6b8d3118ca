pub mod health;
pub mod origin;
pub mod stream;
