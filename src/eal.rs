//! Environment bootstrap.
//!
//! Consumes the leading runtime arguments (core list, main core, memory channels) and leaves the
//! remaining application arguments untouched. The number of consumed arguments is returned so the
//! caller can hand the rest to its own parser, the same split a DPDK application performs after
//! `rte_eal_init`.

use crate::error::FatalError;
use std::collections::BTreeSet;

/// Lcore ids must stay below this bound.
pub const MAX_LCORE: usize = 128;

/// Execution contexts made available to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eal {
    lcores: Vec<usize>,
    main_lcore: usize,
    memory_channels: Option<u32>,
}

impl Eal {
    /// Parse the runtime prefix of `args` (including the program name at index 0).
    ///
    /// Returns the environment and how many arguments were consumed. Parsing stops after a `--`
    /// separator (which is consumed) or before the first argument it does not recognise.
    pub fn init(args: &[String]) -> Result<(Eal, usize), FatalError> {
        let mut lcores: Option<Vec<usize>> = None;
        let mut main_lcore: Option<usize> = None;
        let mut memory_channels = None;
        let mut consumed = args.len().min(1);

        while consumed < args.len() {
            let arg = args[consumed].as_str();
            let (key, inline) = match arg.split_once('=') {
                Some((key, value)) if key.starts_with("--") => (key, Some(value.to_string())),
                _ => (arg, None),
            };
            match key {
                "--" => {
                    consumed += 1;
                    break;
                }
                "-l" | "--lcores" | "--main-lcore" | "-n" => {
                    let value = match inline {
                        Some(value) => value,
                        None => {
                            consumed += 1;
                            args.get(consumed).cloned().ok_or_else(|| {
                                FatalError::Eal(format!("option {key} requires a value"))
                            })?
                        }
                    };
                    match key {
                        "-l" | "--lcores" => lcores = Some(parse_lcore_list(&value)?),
                        "--main-lcore" => {
                            main_lcore = Some(value.parse().map_err(|_| {
                                FatalError::Eal(format!("invalid main lcore '{value}'"))
                            })?)
                        }
                        _ => {
                            memory_channels = Some(value.parse().map_err(|_| {
                                FatalError::Eal(format!("invalid memory channel count '{value}'"))
                            })?)
                        }
                    }
                    consumed += 1;
                }
                _ => break,
            }
        }

        let lcores = match lcores {
            Some(list) => list,
            None => {
                let online = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (0..online.min(MAX_LCORE)).collect()
            }
        };
        let main_lcore = main_lcore.unwrap_or(lcores[0]);
        if !lcores.contains(&main_lcore) {
            return Err(FatalError::Eal(format!(
                "main lcore {main_lcore} is not in the lcore list"
            )));
        }

        Ok((
            Eal {
                lcores,
                main_lcore,
                memory_channels,
            },
            consumed,
        ))
    }

    /// Build an environment directly, bypassing argument parsing.
    pub fn with_lcores(lcores: Vec<usize>, main_lcore: usize) -> Result<Eal, FatalError> {
        if lcores.is_empty() {
            return Err(FatalError::Eal("empty lcore list".into()));
        }
        if let Some(&lcore) = lcores.iter().find(|&&lcore| lcore >= MAX_LCORE) {
            return Err(FatalError::Eal(format!(
                "lcore {lcore} exceeds the limit of {MAX_LCORE}"
            )));
        }
        if !lcores.contains(&main_lcore) {
            return Err(FatalError::Eal(format!(
                "main lcore {main_lcore} is not in the lcore list"
            )));
        }
        Ok(Eal {
            lcores,
            main_lcore,
            memory_channels: None,
        })
    }

    pub fn lcores(&self) -> &[usize] {
        &self.lcores
    }

    pub fn main_lcore(&self) -> usize {
        self.main_lcore
    }

    /// Every lcore except the main one, ascending.
    pub fn worker_lcores(&self) -> Vec<usize> {
        self.lcores
            .iter()
            .copied()
            .filter(|&lcore| lcore != self.main_lcore)
            .collect()
    }

    pub fn memory_channels(&self) -> Option<u32> {
        self.memory_channels
    }
}

/// Parse a core list such as `0-3,6,8-9` into sorted, unique ids.
pub fn parse_lcore_list(list: &str) -> Result<Vec<usize>, FatalError> {
    let invalid = |why: &str| FatalError::Eal(format!("invalid lcore list '{list}': {why}"));
    let mut ids = BTreeSet::new();

    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty element"));
        }
        let (first, last) = match part.split_once('-') {
            Some((a, b)) => (a, b),
            None => (part, part),
        };
        let first: usize = first.trim().parse().map_err(|_| invalid(part))?;
        let last: usize = last.trim().parse().map_err(|_| invalid(part))?;
        if first > last {
            return Err(invalid("descending range"));
        }
        if last >= MAX_LCORE {
            return Err(invalid("lcore id out of range"));
        }
        for id in first..=last {
            if !ids.insert(id) {
                return Err(invalid("duplicate lcore"));
            }
        }
    }

    Ok(ids.into_iter().collect())
}
