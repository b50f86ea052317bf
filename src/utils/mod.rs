pub mod bins;
pub mod lock;
pub mod process;
