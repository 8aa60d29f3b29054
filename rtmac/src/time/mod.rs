//! Types that describe points in time ([`Time`]) and durations between two
//! instants ([`Duration`])
//!
//! These are used throughout `rtmac` instead of types from `std::time` as
//! they fit closer with the nanosecond timestamps carried on the wire and can
//! represent sub-nanosecond averages.

mod duration;
mod instant;

pub use duration::Duration;
pub use instant::Time;
