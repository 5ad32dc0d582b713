//! Remote endpoint ("data center") table.
//!
//! The table is seeded with built-in defaults and may be overlaid with
//! entries parsed from a `proxy_for <id> <host>:<port>` configuration file.
//! A table is immutable once built; [`EndpointRegistry::reload`] swaps in a
//! complete replacement so readers only ever clone an `Arc` snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Data center identifier. Negative ids appear in overlay files for media DCs.
pub type DcId = i32;

/// Endpoint used when an id is unknown.
pub const FALLBACK_DC: DcId = 1;

/// Built-in data centers.
pub const DEFAULT_ENDPOINTS: [(DcId, &str, u16); 5] = [
    (1, "149.154.175.53", 443),
    (2, "149.154.167.51", 443),
    (3, "149.154.175.100", 443),
    (4, "149.154.167.91", 443),
    (5, "91.108.56.130", 443),
];

/// A remote host the proxy forwards traffic to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Data center id
    pub id: DcId,
    /// Hostname or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(id: DcId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// Address suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DC{} ({})", self.id, self.addr())
    }
}

/// Parse one `proxy_for <id> <host>:<port>` line.
///
/// Returns `None` for anything else, including comments and malformed lines.
pub fn parse_overlay_line(line: &str) -> Option<Endpoint> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "proxy_for" {
        return None;
    }

    let id: DcId = parts.next()?.parse().ok()?;
    let addr = parts.next()?.trim_end_matches(';');
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;

    Some(Endpoint::new(id, host, port))
}

/// Parse every valid overlay line in `text`, skipping the rest.
pub fn parse_overlay(text: &str) -> Vec<Endpoint> {
    text.lines().filter_map(parse_overlay_line).collect()
}

/// Immutable id -> endpoint map with a guaranteed fallback.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    entries: BTreeMap<DcId, Endpoint>,
    fallback: Endpoint,
}

impl EndpointTable {
    /// The built-in table.
    pub fn builtin() -> Self {
        let entries: BTreeMap<DcId, Endpoint> = DEFAULT_ENDPOINTS
            .iter()
            .map(|&(id, host, port)| (id, Endpoint::new(id, host, port)))
            .collect();
        let (id, host, port) = DEFAULT_ENDPOINTS[0];

        Self {
            entries,
            fallback: Endpoint::new(id, host, port),
        }
    }

    /// Built-in table with `overlay` entries replacing defaults by id.
    ///
    /// Later overlay entries win over earlier ones with the same id.
    pub fn with_overlay(overlay: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut table = Self::builtin();
        for endpoint in overlay {
            table.entries.insert(endpoint.id, endpoint);
        }
        if let Some(fallback) = table.entries.get(&FALLBACK_DC) {
            table.fallback = fallback.clone();
        }
        table
    }

    /// Build a table from an overlay file.
    ///
    /// A missing file yields the built-in table. Read errors are reported.
    pub fn load_overlay_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("endpoint overlay {} not found, using defaults", path.display());
            return Ok(Self::builtin());
        }

        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read endpoint overlay {}: {}", path.display(), e))
        })?;
        let overlay = parse_overlay(&text);
        tracing::info!(
            "loaded {} endpoint overlay entries from {}",
            overlay.len(),
            path.display()
        );
        Ok(Self::with_overlay(overlay))
    }

    /// Look up an endpoint, falling back to DC 1 for unknown ids.
    pub fn resolve(&self, id: DcId) -> &Endpoint {
        self.entries.get(&id).unwrap_or(&self.fallback)
    }

    /// Exact lookup without fallback.
    pub fn get(&self, id: DcId) -> Option<&Endpoint> {
        self.entries.get(&id)
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty (never true for tables built here).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ids a client selector can map to: the run of
    /// consecutive ids `1, 2, 3, ...` present in the table.
    ///
    /// Media (negative) and out-of-run ids are reachable only by exact id.
    pub fn selectable_count(&self) -> usize {
        (1..)
            .take_while(|id| self.entries.contains_key(id))
            .count()
    }

    /// Iterate endpoints in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.values()
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Shared handle to the current endpoint table.
pub struct EndpointRegistry {
    table: RwLock<Arc<EndpointTable>>,
}

impl EndpointRegistry {
    /// Create a registry serving `table`.
    pub fn new(table: EndpointTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Current table. The read lock is held only for the `Arc` clone.
    pub fn snapshot(&self) -> Arc<EndpointTable> {
        Arc::clone(&self.table.read())
    }

    /// Resolve an id against the current table.
    pub fn resolve(&self, id: DcId) -> Endpoint {
        self.snapshot().resolve(id).clone()
    }

    /// Number of endpoints in the current table.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the current table is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Selectable id count of the current table.
    pub fn selectable_count(&self) -> usize {
        self.snapshot().selectable_count()
    }

    /// Replace the table. Sessions already relaying keep their endpoint.
    pub fn reload(&self, table: EndpointTable) {
        let table = Arc::new(table);
        tracing::info!("endpoint table reloaded ({} entries)", table.len());
        *self.table.write() = table;
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(EndpointTable::builtin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let table = EndpointTable::builtin();
        assert_eq!(table.len(), 5);
        assert_eq!(table.resolve(2).host, "149.154.167.51");
        assert_eq!(table.resolve(5).addr(), "91.108.56.130:443");
    }

    #[test]
    fn test_unknown_id_falls_back() {
        let table = EndpointTable::builtin();
        assert_eq!(table.resolve(42).id, FALLBACK_DC);
        assert_eq!(table.resolve(-3).id, FALLBACK_DC);
        assert!(table.get(42).is_none());
    }

    #[test]
    fn test_parse_overlay() {
        let text = "\
# comment
proxy_for 1 149.154.175.50:8888;
proxy_for -2 149.154.162.38:80
proxy_for 4 [2001:b28:f23d:f001::a]:443;
proxy_for x 1.2.3.4:443
proxy_for 3 1.2.3.4
proxy_for 3 1.2.3.4:notaport
default 2;
";
        let overlay = parse_overlay(text);
        assert_eq!(overlay.len(), 3);
        assert_eq!(overlay[0], Endpoint::new(1, "149.154.175.50", 8888));
        assert_eq!(overlay[1], Endpoint::new(-2, "149.154.162.38", 80));
        assert_eq!(overlay[2].host, "2001:b28:f23d:f001::a");
        assert_eq!(overlay[2].addr(), "[2001:b28:f23d:f001::a]:443");
    }

    #[test]
    fn test_overlay_replaces_by_id() {
        let table = EndpointTable::with_overlay(vec![
            Endpoint::new(1, "10.0.0.1", 443),
            Endpoint::new(7, "10.0.0.7", 443),
            Endpoint::new(7, "10.0.0.77", 8443),
        ]);

        assert_eq!(table.len(), 6);
        assert_eq!(table.resolve(1).host, "10.0.0.1");
        assert_eq!(table.resolve(7).addr(), "10.0.0.77:8443");
        // Fallback follows the overlaid DC 1
        assert_eq!(table.resolve(99).host, "10.0.0.1");
        assert_eq!(table.resolve(3).host, "149.154.175.100");
    }

    #[test]
    fn test_selectable_count_ignores_media_ids() {
        let overlay = parse_overlay(
            "\
proxy_for 1 149.154.175.50:8888;
proxy_for -1 149.154.175.50:8888;
proxy_for 2 149.154.162.38:80;
proxy_for -2 149.154.162.38:80;
proxy_for 3 149.154.175.100:8888;
proxy_for -3 149.154.175.100:8888;
proxy_for 4 91.108.4.136:8888;
proxy_for -4 149.154.165.109:8888;
proxy_for 5 91.108.56.181:8888;
proxy_for -5 91.108.56.181:8888;
",
        );
        let table = EndpointTable::with_overlay(overlay);

        assert_eq!(table.len(), 10);
        assert_eq!(table.selectable_count(), 5);
        assert_eq!(table.resolve(-4).host, "149.154.165.109");

        let extended = EndpointTable::with_overlay(vec![
            Endpoint::new(6, "10.0.0.6", 443),
            Endpoint::new(9, "10.0.0.9", 443),
        ]);
        assert_eq!(extended.selectable_count(), 6);
    }

    #[test]
    fn test_missing_overlay_file() {
        let table = EndpointTable::load_overlay_file("/nonexistent/proxy-multi.conf").unwrap();
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_registry_reload_swaps_table() {
        let registry = EndpointRegistry::default();
        let before = registry.snapshot();

        registry.reload(EndpointTable::with_overlay(vec![Endpoint::new(2, "10.0.0.2", 443)]));

        // Old snapshot is untouched, new lookups see the overlay
        assert_eq!(before.resolve(2).host, "149.154.167.51");
        assert_eq!(registry.resolve(2).host, "10.0.0.2");
        assert_eq!(registry.len(), 5);
    }
}
