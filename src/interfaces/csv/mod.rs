pub mod command_reader;
pub mod product_reader;
pub mod session_writer;
