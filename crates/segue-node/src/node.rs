//! Client-node event handling.
//!
//! Runs on the thread loop with the control lock held. Every handler
//! mutates the shared node state and, where the protocol asks for it,
//! replies with a port update or a typed node error. Failures inside a
//! handler are reported back to the server; they never tear the client
//! down.

use crate::connection::ConnTx;
use crate::error::{NodeError, Result};
use crate::mem::{MemPool, Tag, TaggedMaps};
use crate::ports::{Chunk, DataPlane};
use crate::process::DataLoopCtl;
use crate::protocol::{
    port_params, BufferDesc, ClientRequest, DataKind, FormatSpec, IntSpec, IoKind, NodeCommand,
    ParamKind, ServerEvent,
};
use crate::registry::{Notify, Registry};
use crate::state::{ActivationPtr, ClientFlags, NodeState, PeerLink};
use segue_core::activation::PositionBlock;
use segue_core::{Direction, PortType, INVALID_ID, MAX_BUFFER_DATAS};
use smallvec::SmallVec;
use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

pub struct EventCtx<'a> {
    pub client_name: &'a str,
    pub state: &'a mut NodeState,
    pub registry: &'a mut Registry,
    pub mem: &'a mut MemPool,
    pub io_maps: &'a mut TaggedMaps,
    pub tx: &'a mut ConnTx,
    pub flags: &'a ClientFlags,
    pub data_loop: &'a DataLoopCtl,
}

impl EventCtx<'_> {
    /// Report a handler failure on the node, mirroring it to the log.
    fn node_error(&mut self, res: i32, message: &str) {
        warn!(res, message, "node error");
        let _ = self.tx.send(&ClientRequest::NodeError {
            res,
            message: message.to_string(),
        });
    }

    fn reply_port_update(&mut self, direction: Direction, port_id: u32) -> Result<()> {
        let port = self.state.ports.port(direction, port_id);
        let rate = port.have_format.then_some(port.rate).filter(|&r| r != 0);
        let params = port_params(port.type_id, rate);
        self.tx.send(&ClientRequest::PortUpdate {
            direction: direction.into(),
            port_id,
            params,
            info: None,
        })
    }

    /// Dispatch one node-side event. Registry notifications bubble up so
    /// the caller can deliver them with the lock released.
    pub fn handle(&mut self, event: ServerEvent, fds: Vec<OwnedFd>) -> SmallVec<[Notify; 2]> {
        let mut notifies = SmallVec::new();
        match event {
            ServerEvent::AddMem { mem_id, kind, flags } => {
                let mut fds = fds;
                if fds.is_empty() {
                    warn!(mem_id, "AddMem without descriptor");
                } else {
                    self.mem.add_block(mem_id, kind, flags, fds.remove(0));
                }
            }
            ServerEvent::RemoveMem { mem_id } => {
                self.mem.remove_block(mem_id);
            }
            ServerEvent::Global { id, kind, props } => {
                if let Some(n) = self.registry.apply_global(
                    self.client_name,
                    self.state.node_id,
                    id,
                    kind,
                    &props,
                ) {
                    notifies.push(n);
                }
            }
            ServerEvent::GlobalRemove { id } => {
                if let Some(n) = self.registry.apply_global_remove(id) {
                    notifies.push(n);
                }
            }
            ServerEvent::Transport { node_id, mem_id, offset, size } => {
                self.handle_transport(node_id, mem_id, offset, size, fds);
            }
            ServerEvent::SetIo { id, mem_id, offset, size } => {
                self.handle_set_io(id, mem_id, offset, size);
            }
            ServerEvent::SetParam { .. } => {
                self.node_error(-libc::ENOTSUP, "set_param not supported");
            }
            ServerEvent::Event { kind } => {
                self.node_error(-libc::ENOTSUP, &format!("event {kind} not supported"));
            }
            ServerEvent::Command(cmd) => self.handle_command(cmd),
            ServerEvent::AddPort { .. } => {
                self.node_error(-libc::ENOTSUP, "add port not supported");
            }
            ServerEvent::RemovePort { .. } => {
                self.node_error(-libc::ENOTSUP, "remove port not supported");
            }
            ServerEvent::PortSetParam { direction, port_id, id, flags: _, param } => {
                self.handle_port_set_param(direction.into(), port_id, id, param);
            }
            ServerEvent::PortUseBuffers { direction, port_id, mix_id, flags: _, buffers } => {
                if let Err(e) =
                    self.handle_port_use_buffers(direction.into(), port_id, mix_id, &buffers)
                {
                    self.node_error(-libc::EINVAL, &e.to_string());
                }
            }
            ServerEvent::PortSetIo { direction, port_id, mix_id, id, mem_id, offset, size } => {
                if let Err(e) =
                    self.handle_port_set_io(direction.into(), port_id, mix_id, id, mem_id, offset, size)
                {
                    self.node_error(-libc::EINVAL, &e.to_string());
                }
            }
            ServerEvent::SetActivation { node_id, mem_id, offset, size } => {
                if let Err(e) = self.handle_set_activation(node_id, mem_id, offset, size, fds) {
                    self.node_error(-libc::EINVAL, &e.to_string());
                }
            }
            // sync and error bookkeeping happen in the loop dispatcher
            ServerEvent::Done { .. } | ServerEvent::Error { .. } => {}
        }
        notifies
    }

    fn handle_transport(
        &mut self,
        node_id: u32,
        mem_id: u32,
        offset: u32,
        size: u32,
        mut fds: Vec<OwnedFd>,
    ) {
        // tear down any previous transport
        self.data_loop.set_rt_socket(None);
        self.flags.started.store(false, Ordering::Release);
        self.state.links.clear();
        self.state.driver_activation = ActivationPtr::NULL;
        self.state.activation = ActivationPtr::NULL;
        self.state.activation_map = None;

        let map = match self.mem.map(mem_id, offset, size, None) {
            Ok(m) => m,
            Err(e) => {
                debug!("can't map activation: {e}");
                return;
            }
        };
        self.state.activation = ActivationPtr(map.ptr_as());
        self.state.activation_map = Some(map);
        self.state.node_id = node_id;

        let readfd = if fds.is_empty() { None } else { Some(fds.remove(0)) };
        // the write end stays with the server; ours closes on drop
        drop(fds);
        debug!(node_id, "client transport created");
        self.data_loop.set_rt_socket(readfd);
    }

    fn handle_set_io(&mut self, id: IoKind, mem_id: u32, offset: u32, size: u32) {
        let tag: Tag = [self.state.node_id, id.raw(), 0, 0, 0];
        drop(self.io_maps.take(&tag));

        let ptr = if mem_id == INVALID_ID {
            std::ptr::null_mut()
        } else {
            match self.mem.map(mem_id, offset, size, Some(tag)) {
                Ok(map) => {
                    let p = map.ptr();
                    self.io_maps.insert(map);
                    p
                }
                Err(e) => {
                    warn!(mem_id, "can't map io memory: {e}");
                    return;
                }
            }
        };
        debug!(?id, ?ptr, "set io");

        if id == IoKind::Position {
            self.state.position = ptr as *mut PositionBlock;
            self.state.driver_id = self
                .state
                .position_snapshot()
                .map(|p| p.clock.id)
                .unwrap_or(INVALID_ID);
            self.state.update_driver_activation();
        }
    }

    fn handle_command(&mut self, cmd: NodeCommand) {
        debug!(?cmd, "node command");
        match cmd {
            NodeCommand::Pause | NodeCommand::Suspend => {
                if self.flags.started.swap(false, Ordering::AcqRel) {
                    self.data_loop.wake();
                }
            }
            NodeCommand::Start => {
                if !self.flags.started.swap(true, Ordering::AcqRel) {
                    self.flags.first.store(true, Ordering::Release);
                    self.flags.thread_entered.store(false, Ordering::Release);
                    self.data_loop.wake();
                }
            }
        }
    }

    fn handle_port_set_param(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: ParamKind,
        param: Option<FormatSpec>,
    ) {
        debug!(?direction, port_id, ?id, "port set param");
        if id == ParamKind::Format {
            if let Err(e) = self.port_set_format(direction, port_id, param) {
                self.node_error(-libc::EINVAL, &e.to_string());
            }
        }
        let _ = self.reply_port_update(direction, port_id);
    }

    fn port_set_format(
        &mut self,
        direction: Direction,
        port_id: u32,
        param: Option<FormatSpec>,
    ) -> Result<()> {
        let port = self.state.ports.port(direction, port_id);
        let type_id = port.type_id;
        match param {
            None => {
                debug!(?direction, port_id, "clear format");
                let mixes: Vec<_> = port.mixes.clone();
                for key in mixes {
                    self.state.ports.mix_mut(key).clear_buffers();
                }
                self.state.ports.port_mut(direction, port_id).have_format = false;
            }
            Some(spec) => {
                let rate = match (type_id, spec) {
                    (PortType::Audio, FormatSpec::AudioRaw { rate, channels: 1, .. }) => {
                        match rate {
                            IntSpec::Fixed(r) => Some(r),
                            _ => {
                                return Err(NodeError::Protocol(
                                    "audio format without a fixed rate".into(),
                                ))
                            }
                        }
                    }
                    (PortType::Midi, FormatSpec::Control) => None,
                    (PortType::Video, FormatSpec::VideoRaw { .. }) => None,
                    (t, s) => {
                        return Err(NodeError::Protocol(format!(
                            "format {s:?} does not match port type {t:?}"
                        )))
                    }
                };
                let port = self.state.ports.port_mut(direction, port_id);
                if let Some(r) = rate {
                    port.rate = r;
                }
                port.have_format = true;
            }
        }
        Ok(())
    }

    fn handle_port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        mix_id: u32,
        buffers: &[BufferDesc],
    ) -> Result<()> {
        if !self.state.ports.port(direction, port_id).valid {
            return Err(NodeError::InvalidArgument(format!(
                "use_buffers on invalid port {port_id}"
            )));
        }
        let key = self
            .state
            .ports
            .ensure_mix(direction, port_id, mix_id)
            .ok_or(NodeError::Exhausted("mix slots"))?;

        debug!(?direction, port_id, mix_id, n = buffers.len(), "use buffers");

        self.state.ports.mix_mut(key).clear_buffers();

        for (i, desc) in buffers.iter().enumerate() {
            let meta_map = match self.mem.map(desc.mem_id, desc.offset, desc.size, None) {
                Ok(m) => m,
                Err(e) => {
                    warn!(mem_id = desc.mem_id, "can't map buffer memory: {e}");
                    continue;
                }
            };

            // chunk headers sit behind the (8-byte rounded) metas
            let mut chunk_base = 0usize;
            for meta in &desc.metas {
                chunk_base += (meta.size as usize + 7) & !7;
            }

            let mix = self.state.ports.mix_mut(key);
            let slot = &mut mix.buffers[i];
            slot.id = i as u32;
            slot.out = false;
            slot.datas.clear();
            slot.mems.clear();

            let meta_ptr = meta_map.ptr();
            slot.mems.push(meta_map);

            for (j, data) in desc.datas.iter().take(MAX_BUFFER_DATAS).enumerate() {
                // Safety: chunk_base stays inside the mapped metadata
                // region the server described.
                let chunk =
                    unsafe { meta_ptr.add(chunk_base + j * std::mem::size_of::<Chunk>()) }
                        as *mut Chunk;
                let plane = match data.kind {
                    DataKind::MemId(block_id) => {
                        let bmm =
                            match self.mem.map(block_id, data.mapoffset, data.maxsize, None) {
                                Ok(m) => m,
                                Err(e) => {
                                    warn!(block_id, "failed to map buffer plane: {e}");
                                    return Err(NodeError::SharedMemory(e.to_string()));
                                }
                            };
                        let ptr = bmm.ptr();
                        let mix = self.state.ports.mix_mut(key);
                        mix.buffers[i].mems.push(bmm);
                        DataPlane { data: ptr, maxsize: data.maxsize, chunk }
                    }
                    DataKind::MemPtr { offset } => DataPlane {
                        // Safety: embedded plane inside the metadata region.
                        data: unsafe { meta_ptr.add(offset as usize) },
                        maxsize: data.maxsize,
                        chunk,
                    },
                };
                self.state.ports.mix_mut(key).buffers[i].datas.push(plane);
            }

            self.state.ports.port_mut(direction, port_id).init_empty();

            let mix = self.state.ports.mix_mut(key);
            mix.buffers[i].out = true;
            if direction == Direction::Output {
                mix.reuse_buffer(i as u32);
            }
        }
        self.state.ports.mix_mut(key).n_buffers = buffers.len() as u32;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        mix_id: u32,
        id: IoKind,
        mem_id: u32,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        let key = self
            .state
            .ports
            .ensure_mix(direction, port_id, mix_id)
            .ok_or(NodeError::Exhausted("mix slots"))?;

        let tag: Tag = [
            self.state.node_id,
            direction.index() as u32,
            port_id,
            mix_id,
            id.raw(),
        ];
        drop(self.io_maps.take(&tag));

        let ptr = if mem_id == INVALID_ID {
            std::ptr::null_mut()
        } else {
            let map = self.mem.map(mem_id, offset, size, Some(tag))?;
            let p = map.ptr();
            self.io_maps.insert(map);
            p
        };
        debug!(?direction, port_id, mix_id, ?id, ?ptr, "port set io");

        if id == IoKind::Buffers {
            self.state.ports.mix_mut(key).io = ptr as *mut _;
        }
        Ok(())
    }

    fn handle_set_activation(
        &mut self,
        node_id: u32,
        mem_id: u32,
        offset: u32,
        size: u32,
        mut fds: Vec<OwnedFd>,
    ) -> Result<()> {
        if node_id == self.state.node_id {
            debug!(node_id, "own activation, ignoring");
            drop(fds);
            return Ok(());
        }

        if mem_id == INVALID_ID {
            let index = self
                .state
                .find_link(node_id)
                .ok_or_else(|| NodeError::NotFound(format!("activation for node {node_id}")))?;
            self.state.links[index].clear();
        } else {
            let map = self.mem.map(mem_id, offset, size, None)?;
            let activation = ActivationPtr(map.ptr_as());
            let signalfd = if fds.is_empty() { None } else { Some(fds.remove(0)) };
            debug!(node_id, mem_id, "peer activation added");
            self.state.links.push(PeerLink {
                node_id,
                mem: Some(map),
                activation,
                signalfd,
            });
        }

        if self.state.driver_id == node_id {
            self.state.update_driver_activation();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{self, ConnRx};
    use crate::process;
    use crate::protocol::{AudioSampleFormat, ParamDesc, WireDirection};
    use crossbeam_channel::Receiver;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct Harness {
        state: NodeState,
        registry: Registry,
        mem: MemPool,
        io_maps: TaggedMaps,
        tx: ConnTx,
        peer: ConnRx,
        flags: ClientFlags,
        ctl: process::DataLoopCtl,
        _invokes: Receiver<process::Invoke>,
    }

    impl Harness {
        fn new() -> Harness {
            let (ours, theirs) = UnixStream::pair().unwrap();
            let (tx, _) = connection::split(ours).unwrap();
            let (_, peer) = connection::split(theirs).unwrap();
            let (ctl, invokes) = process::make_ctl().unwrap();
            Harness {
                state: NodeState::new(crate::buffers::select_mix2()),
                registry: Registry::new(),
                mem: MemPool::new(),
                io_maps: TaggedMaps::new(),
                tx,
                peer,
                flags: ClientFlags::default(),
                ctl,
                _invokes: invokes,
            }
        }

        fn handle(&mut self, event: ServerEvent) -> SmallVec<[Notify; 2]> {
            self.handle_with_fds(event, Vec::new())
        }

        fn handle_with_fds(
            &mut self,
            event: ServerEvent,
            fds: Vec<OwnedFd>,
        ) -> SmallVec<[Notify; 2]> {
            let mut ctx = EventCtx {
                client_name: "h",
                state: &mut self.state,
                registry: &mut self.registry,
                mem: &mut self.mem,
                io_maps: &mut self.io_maps,
                tx: &mut self.tx,
                flags: &self.flags,
                data_loop: &self.ctl,
            };
            ctx.handle(event, fds)
        }

        fn reply(&mut self) -> ClientRequest {
            self.peer
                .recv(Duration::from_millis(200))
                .unwrap()
                .expect("no reply")
        }

        fn audio_port(&mut self) -> u32 {
            let index = self.state.ports.alloc(Direction::Input).unwrap();
            self.state.ports.port_mut(Direction::Input, index).type_id = PortType::Audio;
            index
        }
    }

    fn fixed_audio(rate: u32) -> FormatSpec {
        FormatSpec::AudioRaw {
            format: AudioSampleFormat::F32Planar,
            rate: IntSpec::Fixed(rate),
            channels: 1,
        }
    }

    #[test]
    fn test_unsupported_events_get_typed_errors() {
        let mut h = Harness::new();
        h.handle(ServerEvent::AddPort {
            direction: WireDirection::Input,
            port_id: 0,
            props: vec![],
        });
        match h.reply() {
            ClientRequest::NodeError { res, message } => {
                assert_eq!(res, -libc::ENOTSUP);
                assert!(message.contains("add port"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        h.handle(ServerEvent::SetParam { id: ParamKind::Format, flags: 0 });
        assert!(matches!(h.reply(), ClientRequest::NodeError { res, .. } if res == -libc::ENOTSUP));
    }

    #[test]
    fn test_port_set_param_pins_rate_and_replies() {
        let mut h = Harness::new();
        let port = h.audio_port();
        h.handle(ServerEvent::PortSetParam {
            direction: WireDirection::Input,
            port_id: port,
            id: ParamKind::Format,
            flags: 0,
            param: Some(fixed_audio(44100)),
        });
        let entry = h.state.ports.port(Direction::Input, port);
        assert!(entry.have_format);
        assert_eq!(entry.rate, 44100);

        match h.reply() {
            ClientRequest::PortUpdate { params, .. } => {
                assert_eq!(params.len(), 4);
                assert!(matches!(
                    params[1],
                    ParamDesc::Format(FormatSpec::AudioRaw { rate: IntSpec::Fixed(44100), .. })
                ));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_format_clear_releases_mix_buffers() {
        let mut h = Harness::new();
        let port = h.audio_port();
        let key = h.state.ports.ensure_mix(Direction::Input, port, 0).unwrap();
        h.state.ports.mix_mut(key).n_buffers = 1;
        h.state.ports.port_mut(Direction::Input, port).have_format = true;

        h.handle(ServerEvent::PortSetParam {
            direction: WireDirection::Input,
            port_id: port,
            id: ParamKind::Format,
            flags: 0,
            param: None,
        });
        assert!(!h.state.ports.port(Direction::Input, port).have_format);
        assert_eq!(h.state.ports.mix(key).n_buffers, 0);
        let _ = h.reply();
    }

    #[test]
    fn test_format_type_mismatch_is_rejected() {
        let mut h = Harness::new();
        let port = h.audio_port();
        h.handle(ServerEvent::PortSetParam {
            direction: WireDirection::Input,
            port_id: port,
            id: ParamKind::Format,
            flags: 0,
            param: Some(FormatSpec::Control),
        });
        // error first, then the advertisement reply
        assert!(matches!(h.reply(), ClientRequest::NodeError { res, .. } if res == -libc::EINVAL));
        assert!(matches!(h.reply(), ClientRequest::PortUpdate { .. }));
        assert!(!h.state.ports.port(Direction::Input, port).have_format);
    }

    #[test]
    fn test_commands_toggle_started() {
        let mut h = Harness::new();
        assert!(!h.flags.started.load(Ordering::Acquire));
        h.handle(ServerEvent::Command(NodeCommand::Start));
        assert!(h.flags.started.load(Ordering::Acquire));
        assert!(h.flags.first.load(Ordering::Acquire));
        h.handle(ServerEvent::Command(NodeCommand::Pause));
        assert!(!h.flags.started.load(Ordering::Acquire));
        h.handle(ServerEvent::Command(NodeCommand::Suspend));
        assert!(!h.flags.started.load(Ordering::Acquire));
    }

    #[test]
    fn test_set_activation_and_tombstone() {
        let mut h = Harness::new();
        h.state.node_id = 1;

        let file = tempfile::tempfile().unwrap();
        file.set_len(65536).unwrap();
        h.mem.add_block(9, 0, 0, OwnedFd::from(file));

        h.handle(ServerEvent::SetActivation { node_id: 5, mem_id: 9, offset: 0, size: 1024 });
        let index = h.state.find_link(5).unwrap();
        assert!(!h.state.links[index].activation.is_null());

        // clearing twice: first tombstones, second reports not-found
        h.handle(ServerEvent::SetActivation {
            node_id: 5,
            mem_id: INVALID_ID,
            offset: 0,
            size: 0,
        });
        assert_eq!(h.state.links[index].node_id, INVALID_ID);
        assert!(h.state.links[index].activation.is_null());
        h.handle(ServerEvent::SetActivation {
            node_id: 5,
            mem_id: INVALID_ID,
            offset: 0,
            size: 0,
        });
        assert!(matches!(h.reply(), ClientRequest::NodeError { .. }));
    }

    #[test]
    fn test_own_activation_is_ignored() {
        let mut h = Harness::new();
        h.state.node_id = 3;
        // no mem block registered; the self-loop must not try to map
        h.handle(ServerEvent::SetActivation { node_id: 3, mem_id: 8, offset: 0, size: 64 });
        assert!(h.state.find_link(3).is_none());
    }

    #[test]
    fn test_port_set_io_binds_and_clears() {
        let mut h = Harness::new();
        let port = h.audio_port();

        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        h.mem.add_block(2, 0, 0, OwnedFd::from(file));

        h.handle(ServerEvent::PortSetIo {
            direction: WireDirection::Input,
            port_id: port,
            mix_id: 0,
            id: IoKind::Buffers,
            mem_id: 2,
            offset: 0,
            size: 8,
        });
        let key = h.state.ports.find_mix(Direction::Input, port, 0).unwrap();
        assert!(!h.state.ports.mix(key).io.is_null());

        // clearing is idempotent
        for _ in 0..2 {
            h.handle(ServerEvent::PortSetIo {
                direction: WireDirection::Input,
                port_id: port,
                mix_id: 0,
                id: IoKind::Buffers,
                mem_id: INVALID_ID,
                offset: 0,
                size: 0,
            });
            assert!(h.state.ports.mix(key).io.is_null());
        }
    }

    #[test]
    fn test_transport_maps_activation() {
        let mut h = Harness::new();
        let file = tempfile::tempfile().unwrap();
        file.set_len(65536).unwrap();
        h.mem.add_block(1, 0, 0, OwnedFd::from(file));

        let size = std::mem::size_of::<segue_core::ActivationRecord>() as u32;
        h.handle(ServerEvent::Transport { node_id: 11, mem_id: 1, offset: 0, size });
        assert_eq!(h.state.node_id, 11);
        assert!(!h.state.activation.is_null());
        assert!(h.state.activation_map.is_some());
    }
}
