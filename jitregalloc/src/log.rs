//! The implementation of the `JITRA_LOG*` environment variables.
//!
//! IR dumping is only available when the `ra_debug` feature is enabled: otherwise we expose no-op
//! functions.

use std::{
    env,
    error::Error,
    fs::File,
    io::Write,
    path::PathBuf,
    sync::LazyLock,
};
use strum::{EnumCount, FromRepr};

/// How verbose should logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log allocator events (e.g. spills and edge splits).
    Event,
}

#[derive(Debug)]
pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

/// The process-wide log, configured from `JITRA_LOG` on first use. An invalid `JITRA_LOG` is
/// reported once on stderr and logging falls back to errors only.
pub(crate) static LOG: LazyLock<Log> = LazyLock::new(|| match Log::new() {
    Ok(log) => log,
    Err(e) => {
        eprintln!("jitra-error: {e}");
        Log {
            level: Verbosity::Error,
            path: None,
        }
    }
});

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("JITRA_LOG") {
            Ok(s) => Self::from_config(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn from_config(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log file so that later appends don't add to a
                    // previous run's log.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("JITRA_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid JITRA_LOG level '{s}': {e}"))?;
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("JITRA_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "jitra-error",
                Verbosity::Warning => "jitra-warning",
                Verbosity::Event => "jitra-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

/// Log an allocator event. The message is only formatted if events are being logged.
macro_rules! log_event {
    ($($arg:tt)*) => {
        if $crate::log::LOG.enabled($crate::log::Verbosity::Event) {
            $crate::log::LOG.log($crate::log::Verbosity::Event, &format!($($arg)*));
        }
    };
}
pub(crate) use log_event;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The IR as handed to the allocator.
    PreRA,
    /// The IR after phi elimination.
    PostPhi,
    /// The live intervals after allocation (linear scan only).
    Intervals,
    /// The IR after allocation.
    PostRA,
}

#[cfg(not(feature = "ra_debug"))]
mod internals {
    use super::IRPhase;
    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }
    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "ra_debug")]
mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let mut log_phases = HashSet::new();
        if let Ok(x) = env::var("JITRA_LOG_IR") {
            let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, phases] => (*path, *phases),
                [phases] => ("-", *phases),
                _ => panic!(
                    "JITRA_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"
                ),
            };
            for x in phases.split(',') {
                match IRPhase::from_str(x) {
                    Ok(p) => {
                        log_phases.insert(p);
                    }
                    Err(e) => panic!("{e}"),
                }
            }
            if path != "-" {
                // Truncate any existing log file so that later appends don't add to a previous
                // run's log.
                File::create(path).ok();
            }
            Some((path.to_string(), log_phases))
        } else {
            None
        }
    });

    impl IRPhase {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "pre-ra" => Ok(Self::PreRA),
                "post-phi" => Ok(Self::PostPhi),
                "intervals" => Ok(Self::Intervals),
                "post-ra" => Ok(Self::PostRA),
                _ => Err(format!("Invalid JITRA_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
