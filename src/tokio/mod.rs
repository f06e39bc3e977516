mod conn;
mod cursor;
mod driver;
mod stream;

pub use conn::{Conn, RunResult};
pub use cursor::{Cursor, CursorEvent};
