use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::timeq::Cycle;
use crate::traffic::config::{TrafficConfig, TrafficKind};

const ACCESS_BYTES: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOp {
    Read,
    Write,
}

impl PatternOp {
    pub fn is_store(self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: u64,
    pub op: PatternOp,
    // earliest issue cycle, only traces carry one
    pub cycle: Option<Cycle>,
}

impl Access {
    pub fn new(addr: u64, op: PatternOp) -> Self {
        Self {
            addr,
            op,
            cycle: None,
        }
    }
}

#[derive(Debug)]
pub enum TrafficSource {
    Random {
        rng: StdRng,
        lines: u64,
        write_ratio: f64,
        left: u64,
    },
    // c[i] = f(a[i], b[i]) over three equally sized arrays
    Stream {
        array_bytes: u64,
        stride: u64,
        index: u64,
        phase: u8,
        left: u64,
    },
    Trace(VecDeque<Access>),
}

impl TrafficSource {
    pub fn new(config: &TrafficConfig) -> Result<Self> {
        Ok(match config.kind {
            TrafficKind::Random => Self::Random {
                rng: StdRng::seed_from_u64(config.seed),
                lines: (config.footprint_bytes / ACCESS_BYTES).max(1),
                write_ratio: config.write_ratio,
                left: config.requests,
            },
            TrafficKind::Stream => {
                let array_bytes = config.footprint_bytes / 3 / config.stride * config.stride;
                if array_bytes == 0 {
                    bail!("footprint of {} bytes is too small for stream traffic", config.footprint_bytes);
                }
                Self::Stream {
                    array_bytes,
                    stride: config.stride,
                    index: 0,
                    phase: 0,
                    left: config.requests,
                }
            }
            TrafficKind::Trace => {
                let path = config
                    .trace
                    .as_deref()
                    .ok_or_else(|| anyhow!("trace traffic needs a trace file"))?;
                Self::Trace(load_trace(path)?.into())
            }
        })
    }
}

impl Iterator for TrafficSource {
    type Item = Access;

    fn next(&mut self) -> Option<Access> {
        match self {
            Self::Random {
                rng,
                lines,
                write_ratio,
                left,
            } => {
                *left = left.checked_sub(1)?;
                let addr = rng.gen_range(0..*lines) * ACCESS_BYTES;
                let op = if rng.gen_bool(*write_ratio) {
                    PatternOp::Write
                } else {
                    PatternOp::Read
                };
                Some(Access::new(addr, op))
            }
            Self::Stream {
                array_bytes,
                stride,
                index,
                phase,
                left,
            } => {
                *left = left.checked_sub(1)?;
                let offset = *index * *stride;
                let access = match phase {
                    0 => Access::new(offset, PatternOp::Read),
                    1 => Access::new(*array_bytes + offset, PatternOp::Read),
                    _ => Access::new(2 * *array_bytes + offset, PatternOp::Write),
                };
                *phase += 1;
                if *phase == 3 {
                    *phase = 0;
                    *index = (*index + 1) % (*array_bytes / *stride);
                }
                Some(access)
            }
            Self::Trace(accesses) => accesses.pop_front(),
        }
    }
}

fn parse_op(op: &str) -> Option<PatternOp> {
    match op.to_ascii_lowercase().as_str() {
        "read" | "r" => Some(PatternOp::Read),
        "write" | "w" => Some(PatternOp::Write),
        _ => None,
    }
}

fn parse_line(line: &str) -> Result<Access> {
    let mut fields = line.split_whitespace();
    let addr = fields.next().ok_or_else(|| anyhow!("missing address"))?;
    let digits = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .unwrap_or(addr);
    let addr = u64::from_str_radix(digits, 16).with_context(|| format!("bad address '{addr}'"))?;

    let op = fields.next().ok_or_else(|| anyhow!("missing operation"))?;
    let op = parse_op(op).ok_or_else(|| anyhow!("unknown operation '{op}'"))?;

    let cycle = fields
        .next()
        .map(|c| c.parse::<Cycle>().with_context(|| format!("bad cycle '{c}'")))
        .transpose()?;
    if let Some(extra) = fields.next() {
        bail!("unexpected field '{extra}'");
    }
    Ok(Access { addr, op, cycle })
}

// One access per line; blank lines and `#` comments are skipped.
pub fn parse_trace(text: &str) -> Result<Vec<Access>> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| parse_line(line).with_context(|| format!("trace line {n}")))
        .collect()
}

pub fn load_trace(path: &Path) -> Result<Vec<Access>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read trace {}", path.display()))?;
    parse_trace(&text).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(kind: TrafficKind) -> TrafficConfig {
        TrafficConfig {
            kind,
            footprint_bytes: 3 * 4096,
            requests: 30,
            ..TrafficConfig::default()
        }
    }

    #[test]
    fn trace_lines_parse() {
        let trace = parse_trace("# warm\n0x1000 READ 5\n\n0X2040 write 9\nabc r\n").unwrap();
        assert_eq!(
            trace,
            vec![
                Access { addr: 0x1000, op: PatternOp::Read, cycle: Some(5) },
                Access { addr: 0x2040, op: PatternOp::Write, cycle: Some(9) },
                Access { addr: 0xabc, op: PatternOp::Read, cycle: None },
            ]
        );
    }

    #[test]
    fn trace_errors_name_the_line() {
        let err = parse_trace("0x10 READ 1\n0x20 FETCH 2\n").unwrap_err();
        assert!(format!("{err:#}").contains("trace line 2"), "{err:#}");
        assert!(parse_trace("0xzz READ 1").is_err());
        assert!(parse_trace("0x10 READ 1 2").is_err());
    }

    #[test]
    fn random_is_seeded_and_bounded() {
        let a: Vec<Access> = TrafficSource::new(&cfg(TrafficKind::Random)).unwrap().collect();
        let b: Vec<Access> = TrafficSource::new(&cfg(TrafficKind::Random)).unwrap().collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 30);
        assert!(a.iter().all(|x| x.addr < 3 * 4096 && x.addr % ACCESS_BYTES == 0));
    }

    #[test]
    fn stream_reads_two_arrays_and_writes_the_third() {
        let accesses: Vec<Access> = TrafficSource::new(&cfg(TrafficKind::Stream)).unwrap().collect();
        let ops: Vec<PatternOp> = accesses.iter().take(3).map(|a| a.op).collect();
        assert_eq!(ops, vec![PatternOp::Read, PatternOp::Read, PatternOp::Write]);
        assert_eq!(accesses[0].addr, 0);
        assert_eq!(accesses[1].addr, 4096);
        assert_eq!(accesses[2].addr, 8192);
        assert_eq!(accesses[3].addr, 64);
        assert!(accesses
            .iter()
            .filter(|a| a.op.is_store())
            .all(|a| a.addr >= 8192));
    }

    #[test]
    fn stream_wraps_within_its_arrays() {
        let config = TrafficConfig {
            requests: 3 * 65,
            ..cfg(TrafficKind::Stream)
        };
        let last = TrafficSource::new(&config).unwrap().last().unwrap();
        // 64 elements per array, the 65th iteration starts over
        assert_eq!(last.addr, 8192);
    }
}
