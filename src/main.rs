use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use toml::Table;

use cadcache::sim::config::{CacheConfig, CachePolicyKind, Config, DramConfig, SimConfig};
use cadcache::sim::perf_log::StatsLog;
use cadcache::sim::top::CadCache;
use cadcache::traffic::config::{TrafficConfig, TrafficKind};
use cadcache::traffic::driver::TrafficDriver;
use cadcache::traffic::patterns::TrafficSource;

#[derive(Parser)]
#[command(version, about)]
struct CadCacheArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override number of simulated cycles")]
    cycles: Option<u64>,
    #[arg(long, help = "Override output directory for statistics")]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "Override cache policy (dummy, direct_mapped, kona, our)")]
    policy: Option<CachePolicyKind>,
    #[arg(long, help = "Override cache to working set ratio")]
    ratio: Option<f64>,
    #[arg(long, help = "Replay a trace file instead of the configured traffic")]
    trace: Option<PathBuf>,
    #[arg(long, help = "Override traffic and tuner seed")]
    seed: Option<u64>,
}

pub fn main() -> Result<()> {
    env_logger::init();

    let argv = CadCacheArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;

    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let mut cache_config = CacheConfig::from_section(config_table.get("cache"));
    let local_dram = DramConfig::from_section(config_table.get("local_dram"));
    let remote_dram = DramConfig::from_section(config_table.get("remote_dram"));
    let mut traffic_config = TrafficConfig::from_section(config_table.get("traffic"));

    // override toml configs with argv
    sim_config.cycles = argv.cycles.unwrap_or(sim_config.cycles);
    sim_config.output_dir = argv.output_dir.unwrap_or(sim_config.output_dir);
    cache_config.cache_policy = argv.policy.unwrap_or(cache_config.cache_policy);
    cache_config.ratio = argv.ratio.unwrap_or(cache_config.ratio);
    if let Some(seed) = argv.seed {
        cache_config.seed = seed;
        traffic_config.seed = seed;
    }
    if let Some(trace) = argv.trace {
        traffic_config.kind = TrafficKind::Trace;
        traffic_config.trace = Some(trace);
    }

    cache_config.validate()?;
    local_dram.validate().context("[local_dram]")?;
    remote_dram.validate().context("[remote_dram]")?;
    traffic_config.validate()?;

    let mut top = CadCache::new(&cache_config, &local_dram, &remote_dram);
    let mut driver = TrafficDriver::new(TrafficSource::new(&traffic_config)?);
    let mut log = if sim_config.stats_interval > 0 {
        Some(StatsLog::create(&sim_config.output_dir)?)
    } else {
        None
    };

    let report = driver.run(&mut top, &sim_config, log.as_mut())?;
    if let Some(log) = log {
        log.finish()?;
    }
    top.print_stats(&sim_config.output_dir)?;

    let stats = top.frontend().stats();
    println!("policy          {}", top.frontend().policy().name());
    println!("cycles          {}", report.cycles);
    println!("reads           {} ({} completed)", report.issued_reads, report.completed_reads);
    println!("writes          {}", report.issued_writes);
    println!("hit rate        {:.4}", stats.hit_rate());
    println!("avg read lat    {:.2}", report.average_read_latency());
    Ok(())
}
