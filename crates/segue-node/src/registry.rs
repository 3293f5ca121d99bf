//! Local read-model of the server's object registry.
//!
//! Nodes, ports and links are mirrored from `Global`/`GlobalRemove`
//! events. Applications hold handles to these entries across removal, so
//! removed entries become tombstones: they leave the per-kind walks but
//! stay resolvable by id until the server reuses that id, at which point
//! the new object overwrites through the same map slot.

use crate::protocol::{self, keys, Dict, ObjectKind};
use segue_core::{Direction, LatencyRange, PortFlags, PortType, INVALID_ID, OBJECT_CHUNK};
use tracing::debug;

pub type ObjKey = usize;

#[derive(Debug, Clone, Default)]
pub struct NodeEntry {
    pub name: String,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct PortEntry {
    pub flags: PortFlags,
    pub name: String,
    pub alias1: String,
    pub alias2: String,
    pub type_id: PortType,
    pub node_id: u32,
    /// Index into the local port pool, `INVALID_ID` for foreign ports.
    pub port_id: u32,
    pub monitor_requests: u32,
    pub capture_latency: LatencyRange,
    pub playback_latency: LatencyRange,
    pub priority: i32,
}

impl Default for PortEntry {
    fn default() -> Self {
        Self {
            flags: PortFlags::default(),
            name: String::new(),
            alias1: String::new(),
            alias2: String::new(),
            type_id: PortType::Other,
            node_id: INVALID_ID,
            port_id: INVALID_ID,
            monitor_requests: 0,
            capture_latency: LatencyRange::default(),
            playback_latency: LatencyRange::default(),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkEntry {
    pub src: u32,
    pub dst: u32,
}

#[derive(Debug, Clone)]
pub enum ObjectBody {
    Free,
    Node(NodeEntry),
    Port(PortEntry),
    Link(LinkEntry),
}

#[derive(Debug, Clone)]
pub struct Object {
    pub id: u32,
    pub removed: bool,
    pub body: ObjectBody,
}

/// Callback deliveries produced while the registry lock was held; the
/// caller invokes them with the lock released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify {
    Client { name: String, registered: bool },
    Port { id: u32, registered: bool },
    Connect { src: u32, dst: u32, connected: bool },
}

pub struct Registry {
    slots: Vec<Object>,
    free: Vec<ObjKey>,
    /// Dense id→slot map; grown lazily, never shrunk.
    globals: Vec<Option<ObjKey>>,
    nodes: Vec<ObjKey>,
    ports: Vec<ObjKey>,
    links: Vec<ObjKey>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            globals: Vec::new(),
            nodes: Vec::new(),
            ports: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Take a slot from the free list, growing the arena by one chunk when
    /// it runs dry. Slots are never returned to the allocator.
    pub fn alloc(&mut self) -> ObjKey {
        if self.free.is_empty() {
            let base = self.slots.len();
            for i in 0..OBJECT_CHUNK {
                self.slots.push(Object {
                    id: INVALID_ID,
                    removed: false,
                    body: ObjectBody::Free,
                });
                self.free.push(base + OBJECT_CHUNK - 1 - i);
            }
        }
        self.free.pop().unwrap()
    }

    pub fn get(&self, key: ObjKey) -> Option<&Object> {
        self.slots.get(key)
    }

    pub fn get_mut(&mut self, key: ObjKey) -> Option<&mut Object> {
        self.slots.get_mut(key)
    }

    pub fn port(&self, key: ObjKey) -> Option<&PortEntry> {
        match self.slots.get(key) {
            Some(Object { body: ObjectBody::Port(p), .. }) => Some(p),
            _ => None,
        }
    }

    pub fn port_mut(&mut self, key: ObjKey) -> Option<&mut PortEntry> {
        match self.slots.get_mut(key) {
            Some(Object { body: ObjectBody::Port(p), .. }) => Some(p),
            _ => None,
        }
    }

    pub fn node(&self, key: ObjKey) -> Option<&NodeEntry> {
        match self.slots.get(key) {
            Some(Object { body: ObjectBody::Node(n), .. }) => Some(n),
            _ => None,
        }
    }

    pub fn link(&self, key: ObjKey) -> Option<&LinkEntry> {
        match self.slots.get(key) {
            Some(Object { body: ObjectBody::Link(l), .. }) => Some(l),
            _ => None,
        }
    }

    pub fn lookup_global(&self, id: u32) -> Option<ObjKey> {
        *self.globals.get(id as usize)?
    }

    fn map_global(&mut self, id: u32, key: ObjKey) {
        let idx = id as usize;
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, None);
        }
        self.globals[idx] = Some(key);
    }

    /// Walks over live entries.
    pub fn live_ports(&self) -> impl Iterator<Item = (ObjKey, &PortEntry)> {
        self.ports.iter().filter_map(|&k| {
            let o = &self.slots[k];
            match (&o.body, o.removed) {
                (ObjectBody::Port(p), false) => Some((k, p)),
                _ => None,
            }
        })
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = (ObjKey, &Object, &NodeEntry)> {
        self.nodes.iter().filter_map(|&k| {
            let o = &self.slots[k];
            match (&o.body, o.removed) {
                (ObjectBody::Node(n), false) => Some((k, o, n)),
                _ => None,
            }
        })
    }

    pub fn live_links(&self) -> impl Iterator<Item = (ObjKey, &Object, &LinkEntry)> {
        self.links.iter().filter_map(|&k| {
            let o = &self.slots[k];
            match (&o.body, o.removed) {
                (ObjectBody::Link(l), false) => Some((k, o, l)),
                _ => None,
            }
        })
    }

    pub fn find_port_by_name(&self, name: &str) -> Option<ObjKey> {
        self.live_ports()
            .find(|(_, p)| p.name == name)
            .map(|(k, _)| k)
    }

    pub fn find_link(&self, src: u32, dst: u32) -> Option<ObjKey> {
        self.live_links()
            .find(|(_, _, l)| l.src == src && l.dst == dst)
            .map(|(k, _, _)| k)
    }

    /// Register a locally-created port object (before the server announces
    /// it as a global).
    pub fn add_local_port(&mut self, entry: PortEntry) -> ObjKey {
        let key = self.alloc();
        self.slots[key] = Object {
            id: INVALID_ID,
            removed: false,
            body: ObjectBody::Port(entry),
        };
        self.ports.push(key);
        key
    }

    /// Apply a `Global` event. Returns the callback to deliver, if any.
    pub fn apply_global(
        &mut self,
        self_name: &str,
        self_node_id: u32,
        id: u32,
        kind: ObjectKind,
        props: &Dict,
    ) -> Option<Notify> {
        // an id the server reuses reclaims its tombstone
        if let Some(key) = self.lookup_global(id) {
            if self.slots[key].removed {
                self.slots[key].body = ObjectBody::Free;
                self.slots[key].removed = false;
                self.free.push(key);
                self.globals[id as usize] = None;
            }
        }

        match kind {
            ObjectKind::Node => {
                let base = [keys::NODE_DESCRIPTION, keys::NODE_NICK, keys::NODE_NAME]
                    .iter()
                    .find_map(|k| protocol::dict_lookup(props, k).filter(|s| !s.is_empty()))
                    .unwrap_or("node");
                let entry = NodeEntry {
                    name: format!("{base}/{id}"),
                    priority: protocol::dict_lookup(props, keys::PRIORITY_MASTER)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                };
                debug!(id, name = %entry.name, "add node");
                let name = entry.name.clone();
                let key = self.alloc();
                self.slots[key] = Object { id, removed: false, body: ObjectBody::Node(entry) };
                self.nodes.push(key);
                self.map_global(id, key);
                Some(Notify::Client { name, registered: true })
            }
            ObjectKind::Port => {
                let dsp = protocol::dict_lookup(props, keys::FORMAT_DSP).unwrap_or("other");
                let mut type_id = PortType::from_type_string(dsp)?;
                let node_id: u32 = protocol::dict_lookup(props, keys::NODE_ID)?.parse().ok()?;
                let short = protocol::dict_lookup(props, keys::PORT_NAME)?;

                let mut flags = PortFlags::default();
                for (key, value) in props {
                    match key.as_str() {
                        keys::PORT_DIRECTION => match value.as_str() {
                            "in" => flags |= PortFlags::IS_INPUT,
                            "out" => flags |= PortFlags::IS_OUTPUT,
                            _ => {}
                        },
                        keys::PORT_PHYSICAL => {
                            if value == "true" || value == "1" {
                                flags |= PortFlags::IS_PHYSICAL;
                            }
                        }
                        keys::PORT_TERMINAL => {
                            if value == "true" || value == "1" {
                                flags |= PortFlags::IS_TERMINAL;
                            }
                        }
                        keys::PORT_CONTROL => {
                            if value == "true" || value == "1" {
                                type_id = PortType::Midi;
                            }
                        }
                        _ => {}
                    }
                }

                // a port on our own node was created locally; adopt it
                let mut key = None;
                if node_id == self_node_id {
                    let full = format!("{self_name}:{short}");
                    key = self.find_port_by_name(&full);
                    if key.is_some() {
                        debug!(id, name = %full, "found our port");
                    }
                }
                let key = match key {
                    Some(k) => k,
                    None => {
                        let owner = self.nodes.iter().find_map(|&k| {
                            let o = &self.slots[k];
                            match &o.body {
                                ObjectBody::Node(n) if o.id == node_id && !o.removed => {
                                    Some((n.name.clone(), n.priority))
                                }
                                _ => None,
                            }
                        });
                        let (owner_name, priority) = owner?;
                        let k = self.alloc();
                        self.slots[k] = Object {
                            id,
                            removed: false,
                            body: ObjectBody::Port(PortEntry {
                                name: format!("{owner_name}:{short}"),
                                priority,
                                ..PortEntry::default()
                            }),
                        };
                        self.ports.push(k);
                        k
                    }
                };

                let entry = match &mut self.slots[key].body {
                    ObjectBody::Port(p) => p,
                    _ => return None,
                };
                entry.alias1 = protocol::dict_lookup(props, keys::OBJECT_PATH)
                    .unwrap_or("")
                    .to_string();
                entry.alias2 = protocol::dict_lookup(props, keys::PORT_ALIAS)
                    .unwrap_or("")
                    .to_string();
                entry.flags = flags;
                entry.type_id = type_id;
                entry.node_id = node_id;
                if flags.contains(PortFlags::IS_OUTPUT) {
                    entry.capture_latency = LatencyRange::new(1024, 1024);
                } else {
                    entry.playback_latency = LatencyRange::new(1024, 1024);
                }
                debug!(id, name = %entry.name, ?type_id, "add port");

                self.slots[key].id = id;
                self.map_global(id, key);
                Some(Notify::Port { id, registered: true })
            }
            ObjectKind::Link => {
                let src: u32 = protocol::dict_lookup(props, keys::LINK_OUTPUT_PORT)?
                    .parse()
                    .ok()?;
                let dst: u32 = protocol::dict_lookup(props, keys::LINK_INPUT_PORT)?
                    .parse()
                    .ok()?;
                debug!(id, src, dst, "add link");
                let key = self.alloc();
                self.slots[key] = Object {
                    id,
                    removed: false,
                    body: ObjectBody::Link(LinkEntry { src, dst }),
                };
                self.links.push(key);
                self.map_global(id, key);
                Some(Notify::Connect { src, dst, connected: true })
            }
        }
    }

    /// Apply a `GlobalRemove`: tombstone the entry, keep it resolvable.
    pub fn apply_global_remove(&mut self, id: u32) -> Option<Notify> {
        let key = self.lookup_global(id)?;
        let object = &mut self.slots[key];
        if object.removed {
            return None;
        }
        object.removed = true;
        debug!(id, "removed global");
        match &object.body {
            ObjectBody::Node(n) => Some(Notify::Client { name: n.name.clone(), registered: false }),
            ObjectBody::Port(_) => Some(Notify::Port { id, registered: false }),
            ObjectBody::Link(l) => Some(Notify::Connect { src: l.src, dst: l.dst, connected: false }),
            ObjectBody::Free => None,
        }
    }

    /// Tombstone a locally-owned object (port unregister).
    pub fn remove_local(&mut self, key: ObjKey) {
        if let Some(o) = self.slots.get_mut(key) {
            o.removed = true;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_props(name: &str) -> Dict {
        vec![(keys::NODE_NAME.into(), name.into())]
    }

    fn port_props(node_id: u32, name: &str, dir: &str) -> Dict {
        vec![
            (keys::FORMAT_DSP.into(), "32 bit float mono audio".into()),
            (keys::NODE_ID.into(), node_id.to_string()),
            (keys::PORT_NAME.into(), name.into()),
            (keys::PORT_DIRECTION.into(), dir.into()),
        ]
    }

    #[test]
    fn test_node_name_synthesis() {
        let mut reg = Registry::new();
        let notify = reg
            .apply_global("me", INVALID_ID, 5, ObjectKind::Node, &node_props("system"))
            .unwrap();
        assert_eq!(
            notify,
            Notify::Client { name: "system/5".into(), registered: true }
        );

        // description wins over name
        let props = vec![
            (keys::NODE_NAME.into(), "alsa_pcm".into()),
            (keys::NODE_DESCRIPTION.into(), "Built-in Audio".into()),
        ];
        let notify = reg
            .apply_global("me", INVALID_ID, 6, ObjectKind::Node, &props)
            .unwrap();
        assert_eq!(
            notify,
            Notify::Client { name: "Built-in Audio/6".into(), registered: true }
        );

        // empty props fall back to "node"
        let notify = reg
            .apply_global("me", INVALID_ID, 7, ObjectKind::Node, &vec![])
            .unwrap();
        assert_eq!(
            notify,
            Notify::Client { name: "node/7".into(), registered: true }
        );
    }

    #[test]
    fn test_foreign_port_names_and_flags() {
        let mut reg = Registry::new();
        reg.apply_global("me", INVALID_ID, 1, ObjectKind::Node, &node_props("system"));
        let mut props = port_props(1, "capture_1", "out");
        props.push((keys::PORT_PHYSICAL.into(), "true".into()));

        reg.apply_global("me", INVALID_ID, 2, ObjectKind::Port, &props)
            .unwrap();
        let key = reg.lookup_global(2).unwrap();
        let port = reg.port(key).unwrap();
        assert_eq!(port.name, "system/1:capture_1");
        assert!(port.flags.contains(PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL));
        assert_eq!(port.type_id, PortType::Audio);
        assert_eq!(port.capture_latency, LatencyRange::new(1024, 1024));
        assert_eq!(port.port_id, INVALID_ID);
    }

    #[test]
    fn test_control_property_overrides_type() {
        let mut reg = Registry::new();
        reg.apply_global("me", INVALID_ID, 1, ObjectKind::Node, &node_props("n"));
        let mut props = port_props(1, "ctl", "in");
        props.push((keys::PORT_CONTROL.into(), "true".into()));
        reg.apply_global("me", INVALID_ID, 2, ObjectKind::Port, &props);
        let port = reg.port(reg.lookup_global(2).unwrap()).unwrap();
        assert_eq!(port.type_id, PortType::Midi);
    }

    #[test]
    fn test_local_port_adoption() {
        let mut reg = Registry::new();
        let key = reg.add_local_port(PortEntry {
            name: "me:out_L".into(),
            node_id: 42,
            port_id: 0,
            flags: PortFlags::IS_OUTPUT,
            type_id: PortType::Audio,
            ..PortEntry::default()
        });

        let notify = reg
            .apply_global("me", 42, 33, ObjectKind::Port, &port_props(42, "out_L", "out"))
            .unwrap();
        assert_eq!(notify, Notify::Port { id: 33, registered: true });
        // same slot was adopted, not a fresh one
        assert_eq!(reg.lookup_global(33), Some(key));
        let port = reg.port(key).unwrap();
        assert_eq!(port.port_id, 0);
        assert_eq!(reg.get(key).unwrap().id, 33);
    }

    #[test]
    fn test_tombstone_then_id_reuse() {
        let mut reg = Registry::new();
        reg.apply_global("me", INVALID_ID, 1, ObjectKind::Node, &node_props("a"));
        let key = reg.lookup_global(1).unwrap();

        let notify = reg.apply_global_remove(1).unwrap();
        assert_eq!(notify, Notify::Client { name: "a/1".into(), registered: false });
        // still resolvable after removal
        assert_eq!(reg.lookup_global(1), Some(key));
        assert!(reg.get(key).unwrap().removed);
        assert_eq!(reg.live_nodes().count(), 0);
        // double remove is silent
        assert!(reg.apply_global_remove(1).is_none());

        // the id coming back reclaims the tombstone
        reg.apply_global("me", INVALID_ID, 1, ObjectKind::Node, &node_props("b"));
        let key2 = reg.lookup_global(1).unwrap();
        assert_eq!(reg.node(key2).unwrap().name, "b/1");
        assert_eq!(reg.live_nodes().count(), 1);
    }

    #[test]
    fn test_link_lookup() {
        let mut reg = Registry::new();
        let props = vec![
            (keys::LINK_OUTPUT_PORT.into(), "10".into()),
            (keys::LINK_INPUT_PORT.into(), "20".into()),
        ];
        let notify = reg
            .apply_global("me", INVALID_ID, 30, ObjectKind::Link, &props)
            .unwrap();
        assert_eq!(notify, Notify::Connect { src: 10, dst: 20, connected: true });
        assert!(reg.find_link(10, 20).is_some());
        assert!(reg.find_link(20, 10).is_none());

        reg.apply_global_remove(30);
        assert!(reg.find_link(10, 20).is_none());
    }

    #[test]
    fn test_chunked_growth() {
        let mut reg = Registry::new();
        for i in 0..OBJECT_CHUNK + 1 {
            reg.apply_global("me", INVALID_ID, i as u32, ObjectKind::Node, &node_props("n"));
        }
        assert_eq!(reg.slots.len(), OBJECT_CHUNK * 2);
        assert_eq!(reg.live_nodes().count(), OBJECT_CHUNK + 1);
    }
}
