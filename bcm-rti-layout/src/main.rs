//! Prints the DMA window map for a BCM4387 RTI ring plan, and optionally the context block
//! and pipe 0 control messages the transport would send for it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bcm_rti::boot::{BCM4387_COMPLETION_RINGS, BCM4387_PIPES};
use bcm_rti::codec::ContextBlock;
use bcm_rti::layout::{Layout, LayoutConfig, RegionKind};
use bcm_rti::transport::{CompletionRingParams, PipeParams};
use bcm_rti::Hexdump;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version, about = "Compute the BCM4387 RTI shared window layout for a ring plan")]
struct Args {
    /// Ring plan (hjson). Defaults to the BCM4387 bring-up rings.
    plan: Option<PathBuf>,

    /// Window size in bytes, decimal or 0x-prefixed.
    #[arg(long, value_parser = parse_int)]
    window_size: Option<u64>,

    /// Window IOVA, decimal or 0x-prefixed.
    #[arg(long, value_parser = parse_int)]
    iova: Option<u64>,

    /// Also hexdump the context block and every open message.
    #[arg(long)]
    dump: bool,
}

//=============================================================================
// Plan file
//=============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default)]
    window_size: Option<u64>,
    #[serde(default)]
    window_iova: Option<u64>,
    #[serde(default)]
    transfer_rings: Option<u8>,
    #[serde(default)]
    completion_rings: Option<u8>,
    #[serde(default)]
    ring0_entries: Option<u16>,
    #[serde(default)]
    completion: Vec<CompletionRingEntry>,
    #[serde(default)]
    pipes: Vec<PipeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompletionRingEntry {
    index: u8,
    entries: u16,
    #[serde(default)]
    head_size: u8,
    #[serde(default)]
    foot_size: u8,
    #[serde(default)]
    msi: u16,
    #[serde(default)]
    intmod_delay: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipeEntry {
    index: u8,
    entries: u16,
    #[serde(default)]
    head_size: u8,
    #[serde(default)]
    foot_size: u8,
    completion_ring: u8,
    doorbell: u16,
    #[serde(default)]
    device_resident: bool,
}

impl From<&CompletionRingEntry> for CompletionRingParams {
    fn from(e: &CompletionRingEntry) -> Self {
        CompletionRingParams {
            head_size: e.head_size,
            msi: e.msi,
            ..CompletionRingParams::new(e.index, e.entries, e.foot_size).with_intmod_delay(e.intmod_delay)
        }
    }
}

impl From<&PipeEntry> for PipeParams {
    fn from(e: &PipeEntry) -> Self {
        if e.device_resident {
            PipeParams::device_resident(e.index, e.entries, e.completion_ring, e.doorbell)
        } else {
            PipeParams {
                head_size: e.head_size,
                ..PipeParams::new(e.index, e.entries, e.foot_size, e.completion_ring, e.doorbell)
            }
        }
    }
}

/// Layout geometry plus the rings opened after context registration.
#[derive(Debug)]
struct Plan {
    layout: LayoutConfig,
    completion_rings: Vec<CompletionRingParams>,
    pipes: Vec<PipeParams>,
}

impl Plan {
    fn bcm4387() -> Self {
        Self {
            layout: LayoutConfig::new(),
            completion_rings: BCM4387_COMPLETION_RINGS.to_vec(),
            pipes: BCM4387_PIPES.to_vec(),
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let file: PlanFile = serde_hjson::from_str(text).context("invalid ring plan")?;

        let mut layout = LayoutConfig::new();
        if let Some(size) = file.window_size {
            layout.window_size = usize::try_from(size).context("window_size")?;
        }
        if let Some(iova) = file.window_iova {
            layout.window_iova = iova;
        }
        if let Some(n) = file.transfer_rings {
            layout.transfer_rings = n;
        }
        if let Some(n) = file.completion_rings {
            layout.completion_rings = n;
        }
        if let Some(n) = file.ring0_entries {
            layout.ring0_transfer_entries = n;
            layout.ring0_completion_entries = n;
        }

        for cr in &file.completion {
            if cr.index == 0 || cr.index >= layout.completion_rings {
                bail!("completion ring {} outside 1..{}", cr.index, layout.completion_rings);
            }
        }
        for pipe in &file.pipes {
            if pipe.index == 0 || pipe.index >= layout.transfer_rings {
                bail!("pipe {} outside 1..{}", pipe.index, layout.transfer_rings);
            }
            if pipe.completion_ring != 0 && !file.completion.iter().any(|cr| cr.index == pipe.completion_ring) {
                bail!("pipe {} completes on unknown ring {}", pipe.index, pipe.completion_ring);
            }
        }

        Ok(Self {
            layout,
            completion_rings: file.completion.iter().map(CompletionRingParams::from).collect(),
            pipes: file.pipes.iter().map(PipeParams::from).collect(),
        })
    }

    fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("load {}", path.display()))
    }
}

//=============================================================================
// Layout
//=============================================================================

/// An encoded control structure, for `--dump`.
#[derive(Debug)]
struct Encoded {
    name: String,
    bytes: Vec<u8>,
}

fn build(plan: &Plan) -> Result<(Layout, Vec<Encoded>)> {
    let iova = plan.layout.window_iova;
    let mut layout = Layout::new(&plan.layout)
        .map_err(bcm_rti::Error::from)
        .context("base layout")?;
    let mut encoded = Vec::new();

    for cr in &plan.completion_rings {
        let region = layout
            .allocate_ring(RegionKind::CompletionRing(cr.index), cr.entries, cr.entry_size())
            .map_err(bcm_rti::Error::from)
            .with_context(|| format!("allocate CR{}", cr.index))?;
        encoded.push(Encoded {
            name: format!("open CR{}", cr.index),
            bytes: cr.message(iova + region.offset as u64).to_bytes().to_vec(),
        });
    }

    for pipe in &plan.pipes {
        let ring_iova = if pipe.is_device_resident() {
            0
        } else {
            let region = layout
                .allocate_ring(RegionKind::TransferRing(pipe.index), pipe.entries, pipe.entry_size())
                .map_err(bcm_rti::Error::from)
                .with_context(|| format!("allocate pipe {}", pipe.index))?;
            iova + region.offset as u64
        };
        encoded.push(Encoded {
            name: format!("open pipe {}", pipe.index),
            bytes: pipe.message(ring_iova).to_bytes().to_vec(),
        });
    }

    encoded.insert(
        0,
        Encoded {
            name: "context block".into(),
            bytes: ContextBlock::for_layout(&layout).to_bytes().to_vec(),
        },
    );
    Ok((layout, encoded))
}

fn print_map(layout: &Layout) {
    let config = layout.config();
    println!("{:<20} {:>10} {:>10} {:>12}", "region", "offset", "len", "iova");
    for region in layout.regions() {
        println!(
            "{:<20} {:#010x} {:#010x} {:#012x}",
            format!("{:?}", region.kind),
            region.offset,
            region.len,
            config.window_iova + region.offset as u64
        );
    }
    println!(
        "used {:#x} of {:#x} bytes ({} transfer, {} completion index slots)",
        layout.end(),
        config.window_size,
        config.transfer_rings,
        config.completion_rings
    );
}

fn parse_int(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn run(args: &Args) -> Result<()> {
    let mut plan = match &args.plan {
        Some(path) => Plan::load(path)?,
        None => Plan::bcm4387(),
    };
    if let Some(size) = args.window_size {
        plan.layout.window_size = usize::try_from(size).context("--window-size")?;
    }
    if let Some(iova) = args.iova {
        plan.layout.window_iova = iova;
    }

    let (layout, encoded) = build(&plan)?;
    print_map(&layout);

    if args.dump {
        for item in &encoded {
            println!("\n{} ({} bytes):\n{}", item.name, item.bytes.len(), Hexdump(&item.bytes));
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
