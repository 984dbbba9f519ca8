use crate::kernel_metadata::signal_name;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};

/// A signal number known to be in the valid range [1, 64]. Using a
/// dedicated type keeps raw `i32`s with other meanings from leaking into
/// signal-delivery paths.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Sig {
    sig: i32,
}

pub const SIGHUP: Sig = Sig { sig: libc::SIGHUP };
pub const SIGKILL: Sig = Sig { sig: libc::SIGKILL };
pub const SIGSEGV: Sig = Sig { sig: libc::SIGSEGV };
pub const SIGALRM: Sig = Sig { sig: libc::SIGALRM };
pub const SIGCHLD: Sig = Sig { sig: libc::SIGCHLD };
pub const SIGSTOP: Sig = Sig { sig: libc::SIGSTOP };
pub const SIGTRAP: Sig = Sig { sig: libc::SIGTRAP };

impl Sig {
    pub fn as_raw(self) -> i32 {
        self.sig
    }

    /// Construct from a raw signal number, aborting on out-of-range
    /// values. Use `try_from` where the input is untrusted.
    pub fn from_raw(sig: i32) -> Sig {
        Sig::try_from(sig).unwrap_or_else(|_| fatal!("Invalid signal number {}", sig))
    }
}

impl TryFrom<i32> for Sig {
    type Error = ();

    fn try_from(sig: i32) -> Result<Sig, ()> {
        if (1..=64).contains(&sig) {
            Ok(Sig { sig })
        } else {
            Err(())
        }
    }
}

impl Display for Sig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", signal_name(self.sig))
    }
}

impl Debug for Sig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range() {
        assert!(Sig::try_from(0).is_err());
        assert!(Sig::try_from(65).is_err());
        assert!(Sig::try_from(-3).is_err());
        assert_eq!(libc::SIGKILL, Sig::try_from(libc::SIGKILL).unwrap().as_raw());
    }
}
