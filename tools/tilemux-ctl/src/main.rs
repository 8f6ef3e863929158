//! tilemux-ctl - replay scenarios against an in-process kernel
//!
//! Commands:
//! - `tilemux-ctl run <scenario.toml> [--platform <platform.toml>]` - Replay a scenario
//! - `tilemux-ctl defaults` - Print the default platform configuration

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use tilemux::tcu::{ActId, EpId, Perm, TileId};
use tilemux::{Code, Dispatch, Kernel, PemuxCall, PlatformConfig, Reply, Selector, Syscall};

#[derive(Parser)]
#[command(name = "tilemux-ctl")]
#[command(version)]
#[command(about = "Replay capability and endpoint scenarios", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file
    Run {
        /// Scenario (TOML)
        scenario: PathBuf,

        /// Platform description (TOML), defaults if omitted
        #[arg(short, long)]
        platform: Option<PathBuf>,
    },

    /// Print the default platform configuration
    Defaults,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    description: String,
    #[serde(rename = "step", default)]
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    /// Create an activity and name it
    Spawn { name: String, tile: TileId },
    Exit { act: String },
    /// Hand out a memory gate for tile memory
    Grant {
        act: String,
        dst: Selector,
        tile: TileId,
        addr: u64,
        size: u64,
        perms: String,
        expect: Option<String>,
    },
    /// Give one activity a capability for another
    GrantAct { act: String, dst: Selector, target: String },
    Sys {
        act: String,
        call: Syscall,
        expect: Option<String>,
    },
    /// Privileged activate call of a tile's multiplexer
    Pexc {
        tile: TileId,
        act: String,
        gate: Selector,
        ep: EpId,
        #[serde(default)]
        addr: u64,
        expect: Option<String>,
    },
    Send {
        act: String,
        ep: Selector,
        expect: Option<String>,
    },
    Ack {
        act: String,
        ep: Selector,
        expect: Option<String>,
    },
    /// Complete suspended calls
    Wakeups,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { scenario, platform } => run(&scenario, platform.as_deref())?,
        Commands::Defaults => {
            print!("{}", PlatformConfig::default().to_toml_string()?);
        }
    }

    Ok(())
}

fn load_platform(path: Option<&Path>) -> anyhow::Result<PlatformConfig> {
    let Some(path) = path else {
        return Ok(PlatformConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    PlatformConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn run(path: &Path, platform: Option<&Path>) -> anyhow::Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let scenario: Scenario =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let cfg = load_platform(platform)?;
    log::info!("{} steps on {} tiles", scenario.steps.len(), cfg.tiles.len());

    println!("{} {}", "▶".green(), path.display().to_string().bold());
    if !scenario.description.is_empty() {
        println!("  {}", scenario.description.dimmed());
    }

    let mut runner = Runner {
        kernel: Kernel::new(cfg)?,
        acts: HashMap::new(),
        failures: 0,
    };
    for (i, step) in scenario.steps.iter().enumerate() {
        runner.step(i + 1, step)?;
    }

    println!();
    if runner.failures > 0 {
        bail!("{} of {} steps did not match", runner.failures, scenario.steps.len());
    }
    println!("{} all {} steps matched", "✅".green(), scenario.steps.len());
    Ok(())
}

struct Runner {
    kernel: Kernel,
    acts: HashMap<String, ActId>,
    failures: usize,
}

impl Runner {
    fn act(&self, name: &str) -> anyhow::Result<ActId> {
        match self.acts.get(name) {
            Some(&id) => Ok(id),
            None => bail!("unknown activity '{}'", name),
        }
    }

    fn step(&mut self, no: usize, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Spawn { name, tile } => {
                let id = self.kernel.create_activity(*tile)?;
                self.acts.insert(name.clone(), id);
                println!("{:>3} spawn {} on tile {} -> activity {}", no, name.bold(), tile, id);
            }
            Step::Exit { act } => {
                let id = self.act(act)?;
                self.kernel.exit_activity(id)?;
                println!("{:>3} exit {}", no, act.bold());
            }
            Step::Grant {
                act,
                dst,
                tile,
                addr,
                size,
                perms,
                expect,
            } => {
                let id = self.act(act)?;
                let perms = parse_perms(perms)?;
                let res = self.kernel.grant_memory(id, *dst, *tile, *addr, *size, perms);
                let reply = Reply::from(res.map(|()| 0));
                self.report(no, &format!("{} grant {:#x}+{:#x} -> {}", act, addr, size, dst), reply, expect)?;
            }
            Step::GrantAct { act, dst, target } => {
                let (id, tid) = (self.act(act)?, self.act(target)?);
                self.kernel.grant_activity(id, *dst, tid)?;
                println!("{:>3} {} gets {} at {}", no, act.bold(), target.bold(), dst);
            }
            Step::Sys { act, call, expect } => {
                let id = self.act(act)?;
                match self.kernel.dispatch(id, call) {
                    Dispatch::Replied(reply) => self.report(no, &format!("{} {:?}", act, call), reply, expect)?,
                    Dispatch::Suspended(c) => {
                        println!("{:>3} {} {:?} -> {} (call {})", no, act, call, "suspended".yellow(), c)
                    }
                }
            }
            Step::Pexc {
                tile,
                act,
                gate,
                ep,
                addr,
                expect,
            } => {
                let id = self.act(act)?;
                let ep_sel = self
                    .kernel
                    .pemux(*tile)
                    .and_then(|m| m.ep_sel(*ep))
                    .with_context(|| format!("tile {} has no endpoint {}", tile, ep))?;
                let msg = tilemux::kif::encode(&PemuxCall::Activate {
                    act_sel: id as Selector,
                    gate_sel: *gate,
                    ep_sel,
                    addr: *addr,
                })?;
                let reply = self.kernel.pemux_call(*tile, &msg);
                self.report(no, &format!("tile {} activate({}, {}, EP{})", tile, act, gate, ep), reply, expect)?;
            }
            Step::Send { act, ep, expect } => {
                let id = self.act(act)?;
                let reply = Reply::from(self.kernel.send(id, *ep).map(|()| 0));
                self.report(no, &format!("{} send {}", act, ep), reply, expect)?;
            }
            Step::Ack { act, ep, expect } => {
                let id = self.act(act)?;
                let reply = Reply::from(self.kernel.ack(id, *ep).map(|()| 0));
                self.report(no, &format!("{} ack {}", act, ep), reply, expect)?;
            }
            Step::Wakeups => {
                let done = self.kernel.process_wakeups();
                println!("{:>3} wakeups: {} completed", no, done.len());
                for c in done {
                    println!("      call {} of activity {} -> {:?}", c.call, c.act, c.reply.code());
                }
            }
        }
        Ok(())
    }

    fn report(&mut self, no: usize, what: &str, reply: Reply, expect: &Option<String>) -> anyhow::Result<()> {
        let code = reply.code();
        log::debug!("step {}: {:?}", no, reply);
        let expected = match expect {
            Some(name) => parse_code(name)?,
            None => Code::Success,
        };
        let status = if code == expected {
            format!("{:?}", code).green()
        } else {
            self.failures += 1;
            format!("{:?} (expected {:?})", code, expected).red()
        };
        if code == Code::Success && reply.value != 0 {
            println!("{:>3} {} -> {} = {}", no, what, status, reply.value);
        } else {
            println!("{:>3} {} -> {}", no, what, status);
        }
        Ok(())
    }
}

fn parse_code(name: &str) -> anyhow::Result<Code> {
    (0..=Code::WouldBlock.raw())
        .map(Code::from_raw)
        .find(|c| format!("{:?}", c).eq_ignore_ascii_case(name))
        .with_context(|| format!("unknown error code '{}'", name))
}

fn parse_perms(s: &str) -> anyhow::Result<Perm> {
    let mut perms = Perm::empty();
    for c in s.chars() {
        perms |= match c.to_ascii_lowercase() {
            'r' => Perm::R,
            'w' => Perm::W,
            'x' => Perm::X,
            _ => bail!("unknown permission '{}'", c),
        };
    }
    Ok(perms)
}
