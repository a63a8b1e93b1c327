pub const SUCCESS: i32 = 0;
/// Bad arguments, unreadable or invalid configuration
pub const INPUT_ERROR: i32 = 1;
/// The run started but ended with an error, or output could not be written
pub const EXECUTION_ERROR: i32 = 2;
/// The acquisition device could not be opened
pub const DEVICE_ERROR: i32 = 3;
