//! The program-wrapper framework: the per-compiler strategy trait, the
//! pipeline that turns an invocation into a cache hit or a compiler run, and
//! the GCC-family wrapper.

mod args;
mod capabilities;
mod framework;
mod gcc;
mod resolve;
mod wrapper;

pub use args::{expand_response_files, split_command_line};
pub use capabilities::Capabilities;
pub use framework::handle_command;
pub use gcc::{CompatibleMode, GccWrapper};
pub use resolve::find_wrapper;
pub use wrapper::{ProgramWrapper, WrapperError};
