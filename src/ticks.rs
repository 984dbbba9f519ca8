/// The primary unit of time in retrace: one retired conditional branch,
/// as counted by the performance counter subsystem.
pub type Ticks = u64;
