//! Physical line naming.
//!
//! A DAQ card exposes three families of output lines that this crate cares about:
//! analogue outputs (`ao3`), counters (`ctr0`) and digital lines (`port1/line0`).
//! Digital lines on ports above 0 double as PFI terminals, so the same wire can be
//! spelled `port1/line0`, `P1.0` or `PFI0`. [`PhysicalLine`] parses every spelling into
//! one canonical value, which is what the claim table keys on: claiming `PFI0` and
//! `port1/line0` from two tasks is a conflict.
//!
//! ```
//! use spimcompiler_backend::line::PhysicalLine;
//!
//! let pfi: PhysicalLine = "PFI9".parse().unwrap();
//! let dio: PhysicalLine = "port2/line1".parse().unwrap();
//! assert_eq!(pfi, dio);
//! assert_eq!(dio.to_string(), "port2/line1");
//! assert_eq!(dio.pfi(), Some(9));
//! ```

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::CompileError;

/// Number of lines per digital port that are routed to PFI terminals.
pub const LINES_PER_PFI_PORT: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LineKind {
    Analog,
    Digital,
    Counter,
}
impl fmt::Display for LineKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                LineKind::Analog => "analog",
                LineKind::Digital => "digital",
                LineKind::Counter => "counter",
            }
        )
    }
}

/// Canonical identity of one physical output line on the card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysicalLine {
    AnalogOut(u32),
    Counter(u32),
    Digital { port: u32, line: u32 },
}

impl PhysicalLine {
    pub fn kind(&self) -> LineKind {
        match self {
            PhysicalLine::AnalogOut(_) => LineKind::Analog,
            PhysicalLine::Counter(_) => LineKind::Counter,
            PhysicalLine::Digital { .. } => LineKind::Digital,
        }
    }

    /// PFI number of a digital line, if the line is routed to a PFI terminal.
    pub fn pfi(&self) -> Option<u32> {
        match *self {
            PhysicalLine::Digital { port, line } if port > 0 && line < LINES_PER_PFI_PORT => (port - 1)
                .checked_mul(LINES_PER_PFI_PORT)
                .and_then(|base| base.checked_add(line)),
            _ => None,
        }
    }

    /// Terminal name used when routing signals (`PFI3`), falling back to the canonical name.
    pub fn terminal(&self) -> String {
        match self.pfi() {
            Some(pfi) => format!("PFI{pfi}"),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for PhysicalLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PhysicalLine::AnalogOut(n) => write!(f, "ao{n}"),
            PhysicalLine::Counter(n) => write!(f, "ctr{n}"),
            PhysicalLine::Digital { port, line } => write!(f, "port{port}/line{line}"),
        }
    }
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?xi)^(?:
                ao(?P<ao>\d+)
              | ctr(?P<ctr>\d+)
              | port(?P<port>\d+)/line(?P<line>\d+)
              | p(?P<pport>\d+)\.(?P<pline>\d+)
              | pfi(?P<pfi>\d+)
            )$",
        )
        .expect("line name pattern is valid")
    })
}

impl FromStr for PhysicalLine {
    type Err = CompileError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || CompileError::InvalidLine {
            name: name.to_string(),
        };
        let caps = line_regex().captures(name.trim()).ok_or_else(invalid)?;
        let num = |key: &str| -> Option<Result<u32, CompileError>> {
            caps.name(key)
                .map(|m| m.as_str().parse::<u32>().map_err(|_| invalid()))
        };

        if let Some(n) = num("ao") {
            return Ok(PhysicalLine::AnalogOut(n?));
        }
        if let Some(n) = num("ctr") {
            return Ok(PhysicalLine::Counter(n?));
        }
        if let (Some(port), Some(line)) = (num("port"), num("line")) {
            return Ok(PhysicalLine::Digital {
                port: port?,
                line: line?,
            });
        }
        if let (Some(port), Some(line)) = (num("pport"), num("pline")) {
            return Ok(PhysicalLine::Digital {
                port: port?,
                line: line?,
            });
        }
        if let Some(pfi) = num("pfi") {
            let pfi = pfi?;
            return Ok(PhysicalLine::Digital {
                port: pfi / LINES_PER_PFI_PORT + 1,
                line: pfi % LINES_PER_PFI_PORT,
            });
        }
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_spelling() {
        assert_eq!("ao12".parse::<PhysicalLine>().unwrap(), PhysicalLine::AnalogOut(12));
        assert_eq!("CTR1".parse::<PhysicalLine>().unwrap(), PhysicalLine::Counter(1));
        assert_eq!(
            "P0.4".parse::<PhysicalLine>().unwrap(),
            PhysicalLine::Digital { port: 0, line: 4 }
        );
        assert_eq!(
            "pfi0".parse::<PhysicalLine>().unwrap(),
            PhysicalLine::Digital { port: 1, line: 0 }
        );
    }

    #[test]
    fn port_zero_has_no_pfi() {
        let line: PhysicalLine = "port0/line3".parse().unwrap();
        assert_eq!(line.pfi(), None);
        assert_eq!(line.terminal(), "port0/line3");
        let routed: PhysicalLine = "P1.2".parse().unwrap();
        assert_eq!(routed.terminal(), "PFI2");
    }

    #[test]
    fn huge_port_has_no_pfi() {
        let line: PhysicalLine = "port4294967295/line0".parse().unwrap();
        assert_eq!(line.pfi(), None);
        assert_eq!(line.terminal(), "port4294967295/line0");
        let last: PhysicalLine = "pfi4294967295".parse().unwrap();
        assert_eq!(last.pfi(), Some(u32::MAX));
    }

    #[test]
    fn rejects_garbage() {
        for name in ["", "ao", "port1", "dev1/ao0", "pfi-1", "ao0x"] {
            assert!(
                matches!(name.parse::<PhysicalLine>(), Err(CompileError::InvalidLine { .. })),
                "{name} should not parse"
            );
        }
    }
}
