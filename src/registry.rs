//! The shared 3D cursor and its listeners.
//!
//! A [`CursorRegistry`] owns the current cursor position and broadcasts every
//! change to registered listeners, skipping whichever listener asked for the
//! change. Listeners are held weakly: once the last strong reference to a
//! listener is dropped its entry is pruned before the next broadcast.
//!
//! Callbacks run while the registry is mutably borrowed, so a listener cannot
//! call back into it directly. Instead it returns `Some(position)` from its
//! callback to request a follow-up move; those relays are applied after the
//! broadcast with the requesting listener as caller.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use nalgebra::{Matrix4, Point3};
use thiserror::Error;

use crate::arena::{Arena, Key};
use crate::error::{Result, ViewerError};
use crate::volume::VoxelGrid;

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(1);

/// Identity of one registry, stored by listeners that want to publish back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegistryId(u64);

/// Handle of one registry entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(Key);

/// Back-reference handed to a listener by [`CursorRegistry::cross_register`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegistryLink {
    pub registry: RegistryId,
    pub listener: ListenerId,
}

/// What a listener receives on every broadcast.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CursorUpdate {
    /// New cursor position in world mm.
    pub position: Point3<f64>,
    pub registry: RegistryId,
    /// The receiving entry's own handle.
    pub listener: ListenerId,
}

/// Failure reported by one listener. Logged and skipped by the registry.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// `Ok(Some(p))` asks the registry to move the cursor to `p` once the current
/// broadcast has finished.
pub type ListenerResult = std::result::Result<Option<Point3<f64>>, ListenerError>;

/// Something that follows the cursor.
pub trait CursorListener {
    fn update_cursor(&mut self, update: &CursorUpdate) -> ListenerResult;

    /// Called once by [`CursorRegistry::cross_register`] so the listener can
    /// remember how to publish back.
    fn attach(&mut self, _link: RegistryLink) {}
}

/// Position actually stored after a move.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Settled {
    pub position: Point3<f64>,
    /// Distance in mm between the requested and stored position.
    pub discrepancy: f64,
}

enum Delivery {
    Delivered(ListenerResult),
    Busy,
    Gone,
}

struct Entry {
    alive: Box<dyn Fn() -> bool>,
    update: Box<dyn FnMut(&CursorUpdate) -> Delivery>,
}

pub struct CursorRegistry {
    id: RegistryId,
    grid: Option<VoxelGrid>,
    cursor: Point3<f64>,
    snap: bool,
    max_relay_depth: usize,
    entries: Arena<Entry>,
    order: Vec<ListenerId>,
}

impl std::fmt::Debug for CursorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorRegistry")
            .field("id", &self.id)
            .field("initialised", &self.grid.is_some())
            .field("cursor", &self.cursor)
            .field("listeners", &self.order.len())
            .finish()
    }
}

impl Default for CursorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::with_options(true, 8)
    }

    pub fn with_options(snap: bool, max_relay_depth: usize) -> Self {
        Self {
            id: RegistryId(NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed)),
            grid: None,
            cursor: Point3::origin(),
            snap,
            max_relay_depth,
            entries: Arena::new(),
            order: Vec::new(),
        }
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    pub fn is_initialised(&self) -> bool {
        self.grid.is_some()
    }

    /// Reference grid used for snapping.
    pub fn grid(&self) -> Option<&VoxelGrid> {
        self.grid.as_ref()
    }

    pub fn position(&self) -> Point3<f64> {
        self.cursor
    }

    pub fn set_snap(&mut self, snap: bool) {
        self.snap = snap;
    }

    /// Set up the reference grid and place the cursor at `initial`, snapped.
    pub fn init(&mut self, affine: Matrix4<f64>, dims: [usize; 3], initial: Point3<f64>) -> Result<Settled> {
        if self.grid.is_some() {
            return Err(ViewerError::AlreadyInitialised);
        }
        let grid = VoxelGrid::new(affine, dims)?;
        let settled = self.settle(&grid, initial);
        if settled.discrepancy > 0.0 {
            warn!(
                "initial cursor moved {:.3} mm to the nearest voxel centre",
                settled.discrepancy
            );
        }
        self.grid = Some(grid);
        self.cursor = settled.position;
        Ok(settled)
    }

    /// Forget the reference grid. Listeners stay registered.
    pub fn uninit(&mut self) {
        self.grid = None;
    }

    fn settle(&self, grid: &VoxelGrid, p: Point3<f64>) -> Settled {
        if self.snap {
            let s = grid.snap(&p);
            Settled {
                position: s.position,
                discrepancy: s.discrepancy,
            }
        } else {
            Settled {
                position: p,
                discrepancy: 0.0,
            }
        }
    }

    /// Snap `p` onto the reference grid without moving the cursor.
    pub fn snap(&self, p: Point3<f64>) -> Result<Settled> {
        let grid = self.grid.as_ref().ok_or(ViewerError::NotInitialised)?;
        Ok(self.settle(grid, p))
    }

    /// Move the cursor and notify every listener except `caller`.
    ///
    /// Without a caller the position is snapped first; a caller's position is
    /// taken as-is. The returned [`Settled`] describes this request; relays
    /// queued by listeners are applied afterwards and show in [`Self::position`].
    pub fn set_coords(&mut self, p: Point3<f64>, caller: Option<ListenerId>) -> Result<Settled> {
        let Some(grid) = self.grid.as_ref() else {
            warn!("set_coords on an uninitialised registry ignored");
            return Err(ViewerError::NotInitialised);
        };
        if let Some(caller) = caller {
            if !self.entries.contains(caller.0) {
                warn!("set_coords from unknown listener {caller:?} ignored");
                return Err(ViewerError::InvalidListener(caller));
            }
        }
        let settled = match caller {
            None => self.settle(grid, p),
            Some(_) => Settled {
                position: p,
                discrepancy: 0.0,
            },
        };

        let mut relays = VecDeque::new();
        self.broadcast(settled.position, caller, 0, &mut relays);
        self.cursor = settled.position;
        self.run_relays(relays);
        Ok(settled)
    }

    /// [`Self::set_coords`] on behalf of a cross-registered listener.
    pub fn set_coords_via(&mut self, link: RegistryLink, p: Point3<f64>) -> Result<Settled> {
        if link.registry != self.id {
            warn!("cursor update through foreign registry {:?} ignored", link.registry);
            return Err(ViewerError::InvalidRegistry(link.registry));
        }
        self.set_coords(p, Some(link.listener))
    }

    /// Register `callback` on `listener` and push the current position to it.
    pub fn add_listener<L, F>(&mut self, listener: &Rc<RefCell<L>>, callback: F) -> ListenerId
    where
        L: 'static,
        F: FnMut(&mut L, &CursorUpdate) -> ListenerResult + 'static,
    {
        let id = self.insert(listener, callback);
        self.push_current(id);
        id
    }

    /// Forward plus back registration: the listener receives a
    /// [`RegistryLink`] through [`CursorListener::attach`], then the current
    /// position.
    pub fn cross_register<L>(&mut self, listener: &Rc<RefCell<L>>) -> ListenerId
    where
        L: CursorListener + 'static,
    {
        let id = self.insert(listener, |l: &mut L, u: &CursorUpdate| l.update_cursor(u));
        match listener.try_borrow_mut() {
            Ok(mut l) => l.attach(RegistryLink {
                registry: self.id,
                listener: id,
            }),
            Err(_) => warn!("listener {id:?} busy during cross-registration; no back link"),
        }
        self.push_current(id);
        id
    }

    fn insert<L, F>(&mut self, listener: &Rc<RefCell<L>>, mut callback: F) -> ListenerId
    where
        L: 'static,
        F: FnMut(&mut L, &CursorUpdate) -> ListenerResult + 'static,
    {
        let weak: Weak<RefCell<L>> = Rc::downgrade(listener);
        let watched = weak.clone();
        let entry = Entry {
            alive: Box::new(move || watched.strong_count() > 0),
            update: Box::new(move |update| match weak.upgrade() {
                None => Delivery::Gone,
                Some(rc) => match rc.try_borrow_mut() {
                    Ok(mut l) => Delivery::Delivered(callback(&mut l, update)),
                    Err(_) => Delivery::Busy,
                },
            }),
        };
        let id = ListenerId(self.entries.insert(entry));
        self.order.push(id);
        debug!("listener {id:?} registered ({} total)", self.order.len());
        id
    }

    fn push_current(&mut self, id: ListenerId) {
        if self.grid.is_none() {
            return;
        }
        let mut relays = VecDeque::new();
        self.deliver(id, self.cursor, 0, &mut relays);
        self.run_relays(relays);
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> Result<()> {
        if self.entries.remove(id.0).is_none() {
            warn!("remove_listener: {id:?} is not registered");
            return Err(ViewerError::InvalidListener(id));
        }
        self.order.retain(|&other| other != id);
        Ok(())
    }

    /// Drop entries whose listener no longer exists. Returns how many went.
    pub fn prune_invalid(&mut self) -> usize {
        let dead: Vec<ListenerId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.entries
                    .get(id.0)
                    .map_or(true, |entry| !(entry.alive)())
            })
            .collect();
        for id in &dead {
            self.entries.remove(id.0);
        }
        if !dead.is_empty() {
            self.order.retain(|id| !dead.contains(id));
            debug!("pruned {} dead listener(s)", dead.len());
        }
        dead.len()
    }

    pub fn listener_count(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.entries.contains(id.0)
    }

    fn broadcast(
        &mut self,
        position: Point3<f64>,
        exclude: Option<ListenerId>,
        depth: usize,
        relays: &mut VecDeque<(ListenerId, Point3<f64>, usize)>,
    ) {
        self.prune_invalid();
        let snapshot = self.order.clone();
        debug!(
            "broadcasting {:?} to {} listener(s)",
            position,
            snapshot.len() - usize::from(exclude.is_some_and(|e| snapshot.contains(&e)))
        );
        for id in snapshot {
            if Some(id) == exclude {
                continue;
            }
            self.deliver(id, position, depth, relays);
        }
    }

    fn deliver(
        &mut self,
        id: ListenerId,
        position: Point3<f64>,
        depth: usize,
        relays: &mut VecDeque<(ListenerId, Point3<f64>, usize)>,
    ) {
        let update = CursorUpdate {
            position,
            registry: self.id,
            listener: id,
        };
        let Some(entry) = self.entries.get_mut(id.0) else {
            return;
        };
        match (entry.update)(&update) {
            Delivery::Delivered(Ok(None)) => {}
            Delivery::Delivered(Ok(Some(next))) => relays.push_back((id, next, depth + 1)),
            Delivery::Delivered(Err(e)) => warn!("listener {id:?} failed: {e}"),
            Delivery::Busy => warn!("listener {id:?} is busy; update skipped"),
            Delivery::Gone => {
                warn!("listener {id:?} was dropped; removing");
                self.entries.remove(id.0);
                self.order.retain(|&other| other != id);
            }
        }
    }

    fn run_relays(&mut self, mut relays: VecDeque<(ListenerId, Point3<f64>, usize)>) {
        while let Some((from, position, depth)) = relays.pop_front() {
            if depth > self.max_relay_depth {
                warn!("relay from {from:?} dropped at depth {depth}");
                continue;
            }
            if position == self.cursor {
                continue;
            }
            if !self.entries.contains(from.0) {
                continue;
            }
            self.broadcast(position, Some(from), depth, &mut relays);
            self.cursor = position;
        }
    }
}
