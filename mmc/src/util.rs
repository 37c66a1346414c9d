#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok = 0,

    /// At least one input file failed to compile.
    OtherErrors = 1,

    /// The command was used incorrectly, e.g., with the wrong number of arguments, a bad flag, a bad syntax in a parameter, etc…
    ExUsage = 64,
}

pub fn exit(rc: ReturnCode) -> ! {
    std::process::exit(rc as i32);
}
