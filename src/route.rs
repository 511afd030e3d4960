//! Route installation adapter: pushes the map's route tables out to whatever actually programs
//! the kernel forwarding table (spec §4.6). The real netlink backend is out of scope — this module
//! defines the seam and an in-memory recorder good enough to assert against in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{QspnError, Result};
use crate::map::{GNode, GNodeFlags, LevelMap, Map, Node, NodeFlags, RouteEntry};
use crate::types::{Level, Pos};

/// Destination for computed routes. Implemented once against a real backend (rtnetlink, a
/// routing socket, whatever the embedding daemon uses) and once, here, as [`TestRouteSink`].
pub trait RouteSink: Send + Sync {
    /// Replace the next-hop set for `dest` at `level` with `next_hops` (already cheapest-first).
    fn replace(&self, level: Level, dest: Pos, next_hops: &[RouteEntry]) -> std::io::Result<()>;

    /// Remove any installed route for `dest` at `level`.
    fn delete(&self, level: Level, dest: Pos) -> std::io::Result<()>;

    /// Flush any batched or cached writes (called once per `tick`, after every `replace`/`delete`
    /// has been issued).
    fn flush_cache(&self) -> std::io::Result<()>;
}

/// Scans a level for `UPDATE`-flagged entities, pushes their current best routes to a
/// [`RouteSink`], and clears the flag (`rt_update`). Also drains whatever [`Map::node_del`] has
/// withdrawn outright since the last tick, so a deleted destination gets a `delete` call even
/// though it is no longer live enough to carry its own flag.
pub struct RouteInstaller<S: RouteSink> {
    sink: S,
}

impl<S: RouteSink> RouteInstaller<S> {
    /// Wrap a sink.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// The wrapped sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Install every pending route change at `level`, and clear `UPDATE` on whatever it handled.
    /// Returns the number of entities processed.
    pub fn tick(&self, map: &mut Map, level: Level) -> Result<usize> {
        let pending: Vec<Pos> = match map.level(level)? {
            LevelMap::Internal(m) => m
                .iter_live()
                .filter(|n| n.flags().contains(NodeFlags::UPDATE))
                .map(Node::pos)
                .collect(),
            LevelMap::External(m) => m
                .iter_live()
                .filter(|g| g.flags().contains(GNodeFlags::UPDATE))
                .map(GNode::pos)
                .collect(),
        };

        for &pos in &pending {
            let routes = map.routes(level)?.routes(pos).to_vec();
            let outcome = if routes.is_empty() {
                self.sink.delete(level, pos)
            } else {
                self.sink.replace(level, pos, &routes)
            };
            outcome.map_err(|err| {
                QspnError::MapInconsistency(format!(
                    "route sink rejected update for level {level} pos {pos}: {err}"
                ))
            })?;

            match map.level_mut(level)? {
                LevelMap::Internal(m) => {
                    m.node_mut(pos)?.flags_mut().remove(NodeFlags::UPDATE);
                }
                LevelMap::External(m) => {
                    m.gnode_mut(pos)?.flags_mut().remove(GNodeFlags::UPDATE);
                }
            }
        }

        // `node_del` voids the entity along with the route it withdrew, so it can never show up
        // in the `UPDATE`-flagged scan above; drain its own queue instead, or the sink never
        // hears about the withdrawal at all.
        let deleted = map.take_pending_deletes(level)?;
        for &pos in &deleted {
            self.sink.delete(level, pos).map_err(|err| {
                QspnError::MapInconsistency(format!(
                    "route sink rejected deletion for level {level} pos {pos}: {err}"
                ))
            })?;
        }

        let processed = pending.len() + deleted.len();
        if processed > 0 {
            self.sink.flush_cache().map_err(|err| {
                QspnError::MapInconsistency(format!("route sink flush failed: {err}"))
            })?;
        }

        Ok(processed)
    }
}

/// In-memory [`RouteSink`] for tests: records every `replace`/`delete` so assertions can inspect
/// exactly what the engine decided to install, with no real routing table anywhere nearby.
#[derive(Debug, Default)]
pub struct TestRouteSink {
    installed: Mutex<BTreeMap<(Level, Pos), Vec<RouteEntry>>>,
    flushes: AtomicUsize,
}

impl TestRouteSink {
    /// A sink with nothing installed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of everything currently installed.
    pub fn snapshot(&self) -> BTreeMap<(Level, Pos), Vec<RouteEntry>> {
        self.installed.lock().clone()
    }

    /// How many times [`RouteSink::flush_cache`] has been called.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl RouteSink for TestRouteSink {
    fn replace(&self, level: Level, dest: Pos, next_hops: &[RouteEntry]) -> std::io::Result<()> {
        self.installed.lock().insert((level, dest), next_hops.to_vec());
        Ok(())
    }

    fn delete(&self, level: Level, dest: Pos) -> std::io::Result<()> {
        self.installed.lock().remove(&(level, dest));
        Ok(())
    }

    fn flush_cache(&self) -> std::io::Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
