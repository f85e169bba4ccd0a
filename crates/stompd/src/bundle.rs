use stompd_util::Slab;

use crate::connection::Connection;

/// The set of live connections.
///
/// Connections sit in a slot-reusing slab; a connection's slot index is
/// stable for its whole life and doubles (offset by one past the listener) as
/// its poll token, so readiness events map straight back to the connection.
#[derive(Default)]
pub struct ConnectionBundle {
    conns: Slab<Connection>,
}

impl ConnectionBundle {
    pub fn new() -> Self {
        Self { conns: Slab::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn add(&mut self, conn: Connection) -> usize {
        self.conns.insert(conn)
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.conns.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.conns.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.conns.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.conns.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection)> {
        self.conns.iter_mut()
    }
}
