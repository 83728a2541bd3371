//! Local read-model of the graph server's objects (§3, §4.A, §9).
//!
//! Entries are appended, never reclaimed: a `global_remove` tombstones the
//! slot instead of freeing it, so a port or node handle a caller is still
//! holding stays dereferenceable after the object left the graph. Only a
//! fresh `global` for the same id would ever reuse the slot, and the
//! server never reuses ids while any client could still be holding one, so
//! in practice a tombstoned slot simply stays tombstoned.

use std::collections::HashMap;

use jackshim_proto::{PortFlags, PortType};

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub full_name: String,
    pub flags: PortFlags,
    pub port_type: PortType,
    pub owner_node: u32,
    pub index: u32,
    pub aliases: [Option<String>; 2],
    pub latency_capture: (u32, u32),
    pub latency_playback: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub src_port: u32,
    pub dst_port: u32,
}

#[derive(Debug, Clone)]
pub enum ObjectKind {
    Node(NodeInfo),
    Port(PortInfo),
    Link(LinkInfo),
}

#[derive(Debug, Clone)]
pub struct Object {
    pub id: u32,
    pub kind: ObjectKind,
    pub removed: bool,
}

/// Convenience aliases so call sites can name the kind they expect without
/// matching on `ObjectKind` everywhere.
pub type Node = NodeInfo;
pub type Port = PortInfo;
pub type Link = LinkInfo;

#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Object>,
    by_id: HashMap<u32, usize>,
    /// Full port name -> slot index, so locally-registered ports created
    /// via `port_register` are matched back to their own `global` echo
    /// instead of allocating a duplicate entry.
    port_by_name: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&mut self, id: u32, kind: ObjectKind) -> usize {
        if let Some(&idx) = self.by_id.get(&id) {
            self.slots[idx] = Object { id, kind, removed: false };
            return idx;
        }
        let idx = self.slots.len();
        self.slots.push(Object { id, kind, removed: false });
        self.by_id.insert(id, idx);
        idx
    }

    pub fn node_global(&mut self, id: u32, description: Option<&str>, nick: Option<&str>, name: Option<&str>, priority_master: Option<i32>) {
        let name = [description, nick, name]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .unwrap_or("node")
            .to_string();
        let name = format!("{name}/{id}");
        self.upsert(id, ObjectKind::Node(NodeInfo { name, priority: priority_master.unwrap_or(0) }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn port_global(
        &mut self,
        id: u32,
        owner_node: u32,
        index: u32,
        short_name: &str,
        port_type: PortType,
        flags: PortFlags,
        is_control: bool,
        local_client_node: Option<u32>,
        local_client_name: &str,
    ) {
        let port_type = if is_control { PortType::Midi } else { port_type };

        // A port we registered locally echoes back from the server with
        // the same owning node id; match it by name instead of creating a
        // second entry for it.
        if local_client_node == Some(owner_node) {
            let local_full = format!("{local_client_name}:{short_name}");
            if let Some(&idx) = self.port_by_name.get(&local_full) {
                if let ObjectKind::Port(p) = &mut self.slots[idx].kind {
                    p.flags = flags;
                    p.port_type = port_type;
                }
                self.by_id.insert(id, idx);
                return;
            }
        }

        let owner_name = self.node_name(owner_node).unwrap_or_else(|| "node".to_string());
        let full_name = format!("{owner_name}:{short_name}");
        let info = PortInfo {
            full_name: full_name.clone(),
            flags,
            port_type,
            owner_node,
            index,
            aliases: [None, None],
            latency_capture: (0, 0),
            latency_playback: (0, 0),
        };
        let idx = self.upsert(id, ObjectKind::Port(info));
        self.port_by_name.insert(full_name, idx);
    }

    pub fn link_global(&mut self, id: u32, src_port: u32, dst_port: u32) {
        self.upsert(id, ObjectKind::Link(LinkInfo { src_port, dst_port }));
    }

    pub fn global_remove(&mut self, id: u32) {
        if let Some(&idx) = self.by_id.get(&id) {
            self.slots[idx].removed = true;
        }
    }

    pub fn get(&self, id: u32) -> Option<&Object> {
        self.by_id.get(&id).map(|&idx| &self.slots[idx])
    }

    pub fn node_name(&self, id: u32) -> Option<String> {
        match &self.get(id)?.kind {
            ObjectKind::Node(n) => Some(n.name.clone()),
            _ => None,
        }
    }

    /// Live (non-tombstoned) ports, for the out-of-scope `get_ports`
    /// query wrapper to filter further.
    pub fn live_ports(&self) -> impl Iterator<Item = (u32, &PortInfo)> {
        self.slots.iter().filter(|o| !o.removed).filter_map(|o| match &o.kind {
            ObjectKind::Port(p) => Some((o.id, p)),
            _ => None,
        })
    }

    pub fn port_by_id(&self, id: u32) -> Option<&PortInfo> {
        match &self.get(id)?.kind {
            ObjectKind::Port(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstoned_object_stays_resolvable() {
        let mut r = Registry::new();
        r.node_global(1, Some("amp"), None, None, None);
        r.global_remove(1);
        let obj = r.get(1).expect("tombstoned node still resolvable by id");
        assert!(obj.removed);
        assert!(matches!(obj.kind, ObjectKind::Node(_)));
    }

    #[test]
    fn local_port_is_matched_by_name_not_duplicated() {
        let mut r = Registry::new();
        r.node_global(1, Some("myclient"), None, None, None);
        // Server echoes back our own port registration.
        r.port_global(10, 1, 0, "out_L", PortType::Audio, PortFlags::new(PortFlags::IS_OUTPUT), false, Some(1), "myclient");
        assert_eq!(r.live_ports().count(), 1);
        assert_eq!(r.port_by_id(10).unwrap().full_name, "myclient:out_L");
    }

    #[test]
    fn removed_ports_are_excluded_from_live_ports() {
        let mut r = Registry::new();
        r.node_global(1, Some("n"), None, None, None);
        r.port_global(10, 1, 0, "p", PortType::Audio, PortFlags::default(), false, None, "n");
        r.global_remove(10);
        assert_eq!(r.live_ports().count(), 0);
        assert!(r.get(10).is_some());
    }
}
