pub mod board;
pub mod sim;
