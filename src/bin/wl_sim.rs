//! A driver for the wear-leveling engine.
//!
//! Attaches to a simulated NAND image (or, on Linux, a real MTD device), runs a write workload
//! through the in-memory LEB table, and reports how evenly the erases were spread. Set `RUST_LOG`
//! (e.g. `RUST_LOG=ubi_wl=debug`) to watch the engine work.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(target_os = "linux")]
use ubi_wl::nand::mtd::MtdNand;
use ubi_wl::{
    eba::{LebId, MemEba},
    nand::{Nand, NandLayout, SimNand},
    ubi::{scan_blocks, AttachInfo, NandIo},
    Ubi, UbiDevice, WlConfig,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)?;
                }
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(mut sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// Engine tunables exposed on the command line
#[derive(Args, Debug, Clone)]
struct EngineOptions {
    /// EC difference that triggers a wear-leveling move
    #[clap(long, default_value_t = 64)]
    wl_threshold: u64,

    /// LEBs packed into one PEB by consolidation; 1 disables it
    #[clap(long, default_value_t = 1)]
    lebs_per_cpeb: usize,

    /// Consolidate whenever possible, not only when running low on free PEBs
    #[clap(long)]
    force_consolidation: bool,

    /// Run background jobs on the calling thread instead of a worker thread
    #[clap(long)]
    inline: bool,

    /// Run consistency checks after attaching and after the workload
    #[clap(long)]
    self_checks: bool,
}

impl From<EngineOptions> for WlConfig {
    fn from(value: EngineOptions) -> Self {
        WlConfig::default()
            .wl_threshold(value.wl_threshold)
            .lebs_per_cpeb(value.lebs_per_cpeb)
            .force_consolidation(value.force_consolidation)
            .background(!value.inline)
            .self_checks(value.self_checks)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of the content of each PEB; this is a read-only operation
    Overview,

    /// Attach, let pending erases finish, and print per-PEB erase and read counters
    Stats,

    /// Write a set of LEBs, then keep rewriting a few "hot" ones
    Workload {
        /// How many LEBs to write
        #[clap(long, default_value_t = 16)]
        lebs: u32,

        /// How many of them to rewrite on every round
        #[clap(long, default_value_t = 2)]
        hot: u32,

        /// How many rounds of rewrites
        #[clap(long, default_value_t = 200)]
        rounds: u32,
    },
}

impl Command {
    fn execute(self, engine: EngineOptions, nand: NandImpl) -> Result<NandImpl> {
        Ok(match nand {
            NandImpl::Sim(nand) => NandImpl::Sim(self.execute_on(engine, nand)?),

            #[cfg(target_os = "linux")]
            NandImpl::Mtd(nand) => NandImpl::Mtd(self.execute_on(engine, nand)?),
        })
    }

    fn execute_on<N: Nand + Send + 'static>(self, engine: EngineOptions, mut nand: N) -> Result<N> {
        if let Command::Overview = self {
            let ebt = scan_blocks(&mut nand)?;
            for (i, content) in ebt.iter().enumerate() {
                println!("{i:4} => {content:?}");
            }
            return Ok(nand);
        }

        let io = Arc::new(NandIo::new(nand));
        let ai = AttachInfo::from_ebt(&io.scan()?);
        let eba = Arc::new(MemEba::from_attach(&ai));
        let ubi = Ubi::attach(io.clone(), eba.clone(), engine.into(), &ai)?;
        settle(&ubi)?;

        if let Command::Workload { lebs, hot, rounds } = self {
            workload(&ubi, &eba, lebs, hot.min(lebs), rounds)?;
        }

        print_stats(&ubi)?;
        if ubi.config().self_checks {
            ubi.self_check()?;
        }

        ubi.close();
        drop(eba);

        let Ok(io) = Arc::try_unwrap(io) else {
            bail!("NAND still in use after detaching");
        };
        Ok(io.into_inner())
    }
}

/// Wait for every background job queued so far
fn settle(ubi: &UbiDevice) -> Result<()> {
    if ubi.config().background {
        ubi.flush()?;
    } else {
        ubi.run_pending();
    }
    Ok(())
}

fn payload(leb: LebId, round: u32) -> Vec<u8> {
    format!("LEB {leb}, round {round}").into_bytes()
}

fn workload(ubi: &UbiDevice, eba: &MemEba, lebs: u32, hot: u32, rounds: u32) -> Result<()> {
    let leb = |lnum| LebId::new(0, lnum);

    for lnum in 0..lebs {
        eba.write_leb(ubi, leb(lnum), &payload(leb(lnum), 0))?;
        settle(ubi)?;
    }

    let rpt = howudoin::new()
        .label("Rewriting LEBs")
        .set_len(u64::from(rounds));
    for round in 1..=rounds {
        for lnum in 0..hot {
            eba.write_leb(ubi, leb(lnum), &payload(leb(lnum), round))?;
        }
        settle(ubi)?;
        rpt.inc();
    }
    rpt.close();

    // Everything must read back as last written, wherever the engine moved it
    for lnum in 0..lebs {
        let round = if lnum < hot { rounds } else { 0 };
        let expected = payload(leb(lnum), round);
        let Some(data) = eba.read_leb(ubi, leb(lnum))? else {
            bail!("LEB {} lost", leb(lnum));
        };
        if !data.starts_with(&expected) {
            bail!("LEB {} corrupted", leb(lnum));
        }
    }

    Ok(())
}

fn print_stats(ubi: &UbiDevice) -> Result<()> {
    let stats = ubi.report_block_stats(None)?;
    for s in &stats {
        let owner = ubi
            .owner(s.pnum)
            .map_or("-".to_string(), |owner| format!("{owner:?}"));
        println!(
            "{:4} => ec {:6}, reads {:6}, {owner}",
            s.pnum, s.ec, s.read_count
        );
    }

    let min_ec = stats.iter().map(|s| s.ec).min().unwrap_or(0);
    let cap = ubi.capacity();
    println!(
        "ec {min_ec}..{}, {} free, {} good, {} bad, {} reserved for bad blocks{}",
        ubi.max_ec(),
        ubi.free_count(),
        cap.good_peb_count,
        cap.bad_peb_count,
        cap.beb_rsvd_pebs,
        if ubi.is_read_only() { ", READ-ONLY" } else { "" }
    );

    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    engine: EngineOptions,

    /// What to do with this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let nand = args.cmd.execute(args.engine, nand)?;
    args.nand.cleanup(nand)?;
    Ok(())
}
