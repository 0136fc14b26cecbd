use std::collections::HashSet;
use std::ops::RangeInclusive;

use anyhow::{Result, bail};
use tracing::debug;
use uuid::Uuid;

use crate::ssh::CommandRunner;

pub const PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

const SOCKET_TABLE_COMMAND: &str = "ss -tan 2>/dev/null || netstat -tan 2>/dev/null";

/// Local ports in an `ss -tan` or `netstat -tan` table. Both put the local
/// address in the fourth column.
pub fn parse_used_ports(table: &str) -> HashSet<u16> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| {
            let (_, port) = local.rsplit_once(':').or_else(|| local.rsplit_once('.'))?;
            port.parse().ok()
        })
        .collect()
}

/// First port of [`PORT_RANGE`] not in `used`, scanning from `start`.
pub fn pick_free_port(used: &HashSet<u16>, start: u16) -> Option<u16> {
    let lo = *PORT_RANGE.start() as u32;
    let span = *PORT_RANGE.end() as u32 - lo + 1;
    let offset = (start as u32).saturating_sub(lo) % span;
    (0..span)
        .map(|i| (lo + (offset + i) % span) as u16)
        .find(|port| !used.contains(port))
}

/// Free host port on the managed host, from the set difference of the
/// dynamic range and the host's socket table.
pub async fn allocate_port(runner: &dyn CommandRunner) -> Result<u16> {
    let out = runner.run_command(SOCKET_TABLE_COMMAND).await?;
    if !out.success() && out.output.trim().is_empty() {
        bail!("Failed to list sockets on {}", runner.host());
    }
    let used = parse_used_ports(&out.output);
    // Spread concurrent allocations across the range.
    let bytes = *Uuid::new_v4().as_bytes();
    let seed = u16::from_le_bytes([bytes[0], bytes[1]]);
    let start = PORT_RANGE.start().wrapping_add(seed % 16384);
    match pick_free_port(&used, start) {
        Some(port) => {
            debug!(port, used = used.len(), "allocated host port");
            Ok(port)
        }
        None => bail!("No free port in {}-{}", PORT_RANGE.start(), PORT_RANGE.end()),
    }
}
