pub mod debug;
pub mod flow;
pub mod logic;
pub mod math;
pub mod utility;
