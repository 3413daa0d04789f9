use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{encode_command, VwpReader, VwpWriter, FLAG_REPLY, HANDSHAKE, HEADER_LEN},
    types::{
        EvalOutcome, FrameId, FrameInfo, FunctionInfo, LineTableEntry, Location, NamedValue,
        ObjectId, ObjectSummary, RefTag, RequestId, Result, StepDepth, ThreadId, TypeDesc,
        TypeInfo, VwpError, VwpEvent, EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION,
        EVENT_KIND_FUNCTION_ENTRY, EVENT_KIND_SINGLE_STEP, EVENT_KIND_THREAD_DEATH,
        EVENT_KIND_VM_EXIT,
    },
};

#[derive(Debug, Clone)]
pub struct VwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    pub pending_channel_size: usize,
    pub event_channel_size: usize,
}

impl Default for VwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            pending_channel_size: 256,
            event_channel_size: 64,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, oneshot::Sender<std::result::Result<Reply, VwpError>>>>,
    next_id: AtomicU32,
    events: broadcast::Sender<VwpEvent>,
    shutdown: CancellationToken,
    config: VwpClientConfig,
}

/// Async VWP connection to a Vela VM.
///
/// Cloning is cheap; all clones share one TCP connection and one event
/// channel.
#[derive(Clone)]
pub struct VwpClient {
    inner: Arc<Inner>,
}

impl VwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, VwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: VwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| VwpError::Timeout)??;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| VwpError::Timeout)??;

        if handshake != *HANDSHAKE {
            return Err(VwpError::HandshakeFailed);
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::with_capacity(config.pending_channel_size)),
            next_id: AtomicU32::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        Ok(Self { inner })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// A token that is cancelled when the VWP client is shut down, either
    /// explicitly via [`VwpClient::shutdown`] or implicitly when the underlying
    /// TCP connection closes.
    ///
    /// Higher layers (the DAP server) use this to exit cleanly when the
    /// debuggee disconnects.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VwpEvent> {
        self.inner.events.subscribe()
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&packet).await?;
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(VwpError::Cancelled);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(r)) => r,
                    Ok(Err(_closed)) => return Err(VwpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        return Err(VwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            return Err(VwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    /// Vm.AllThreads (1, 1)
    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self.send_command_raw(1, 1, Vec::new()).await?;
        let mut r = VwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            threads.push(r.read_u64()?);
        }
        Ok(threads)
    }

    /// Vm.Suspend (1, 2)
    pub async fn vm_suspend(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 2, Vec::new()).await?;
        Ok(())
    }

    /// Vm.Resume (1, 3)
    pub async fn vm_resume(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 3, Vec::new()).await?;
        Ok(())
    }

    /// Vm.Dispose (1, 4)
    ///
    /// Tells the VM to drop all debug state and continue (or exit, if it was
    /// started suspended and the launch is being abandoned).
    pub async fn vm_dispose(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 4, Vec::new()).await?;
        Ok(())
    }

    /// Thread.Name (2, 1)
    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        let payload = self.send_command_raw(2, 1, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        r.read_string()
    }

    /// Thread.Suspend (2, 2)
    pub async fn thread_suspend(&self, thread: ThreadId) -> Result<()> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        let _ = self.send_command_raw(2, 2, w.into_vec()).await?;
        Ok(())
    }

    /// Thread.Resume (2, 3)
    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        let _ = self.send_command_raw(2, 3, w.into_vec()).await?;
        Ok(())
    }

    /// Thread.Frames (2, 4)
    ///
    /// `start` is 0 for the innermost frame; `length` of -1 requests all
    /// remaining frames.
    pub async fn thread_frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(2, 4, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_u64()?;
            let location = r.read_location()?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// Thread.FrameCount (2, 5)
    ///
    /// The call stack depth of a suspended thread. Step requests use this to
    /// record the origin depth a step started from.
    pub async fn thread_frame_count(&self, thread: ThreadId) -> Result<u32> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        let payload = self.send_command_raw(2, 5, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        r.read_u32()
    }

    /// Frame.Locals (3, 1)
    pub async fn frame_locals(&self, thread: ThreadId, frame: FrameId) -> Result<Vec<NamedValue>> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        w.write_u64(frame);
        let payload = self.send_command_raw(3, 1, w.into_vec()).await?;
        read_named_values(&payload)
    }

    /// Frame.Globals (3, 2)
    ///
    /// Module-level bindings visible from the frame's function.
    pub async fn frame_globals(&self, thread: ThreadId, frame: FrameId) -> Result<Vec<NamedValue>> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        w.write_u64(frame);
        let payload = self.send_command_raw(3, 2, w.into_vec()).await?;
        read_named_values(&payload)
    }

    /// Object.Summary (4, 1)
    pub async fn object_summary(&self, object: ObjectId) -> Result<ObjectSummary> {
        let mut w = VwpWriter::new();
        w.write_u64(object);
        let payload = self.send_command_raw(4, 1, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        let type_desc = r.read_u64()?;
        let type_name = r.read_string()?;
        let tag = RefTag::from_wire(r.read_u8()?);
        let size = r.read_u32()?;
        let brief = if r.read_bool()? {
            Some(r.read_string()?)
        } else {
            None
        };
        Ok(ObjectSummary {
            type_desc,
            type_name,
            tag,
            size,
            brief,
        })
    }

    /// Object.Children (4, 2)
    ///
    /// A window of an object's children (fields, elements, or entries,
    /// depending on its tag). `count` of 0 requests everything from `start`.
    pub async fn object_children(
        &self,
        object: ObjectId,
        start: u32,
        count: u32,
    ) -> Result<Vec<NamedValue>> {
        let mut w = VwpWriter::new();
        w.write_u64(object);
        w.write_u32(start);
        w.write_u32(count);
        let payload = self.send_command_raw(4, 2, w.into_vec()).await?;
        read_named_values(&payload)
    }

    /// Eval.Evaluate (5, 1)
    ///
    /// Evaluates `expression` in the scope of a suspended frame. Evaluation
    /// failures come back as [`EvalOutcome::Error`] with the runtime's
    /// message, not as a VM error code; error codes are reserved for stale
    /// threads/frames.
    pub async fn evaluate(
        &self,
        thread: ThreadId,
        frame: FrameId,
        expression: &str,
    ) -> Result<EvalOutcome> {
        let mut w = VwpWriter::new();
        w.write_u64(thread);
        w.write_u64(frame);
        w.write_string(expression);
        let payload = self.send_command_raw(5, 1, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        let status = r.read_u8()?;
        match status {
            0 => Ok(EvalOutcome::Value(r.read_value()?)),
            1 => Ok(EvalOutcome::Error(r.read_string()?)),
            other => Err(VwpError::Protocol(format!(
                "unknown evaluate status: {other}"
            ))),
        }
    }

    /// EventRequest.Set (6, 1)
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<RequestId> {
        let mut w = VwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w);
        }
        let payload = self.send_command_raw(6, 1, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        r.read_i32()
    }

    /// EventRequest.Clear (6, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: RequestId) -> Result<()> {
        let mut w = VwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        let _ = self.send_command_raw(6, 2, w.into_vec()).await?;
        Ok(())
    }

    /// Meta.FunctionInfo (7, 1)
    pub async fn function_info(&self, function_id: u64) -> Result<FunctionInfo> {
        let mut w = VwpWriter::new();
        w.write_u64(function_id);
        let payload = self.send_command_raw(7, 1, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        Ok(FunctionInfo {
            name: r.read_string()?,
            source_file: r.read_string()?,
        })
    }

    /// Meta.LineTable (7, 2)
    pub async fn line_table(&self, function_id: u64) -> Result<Vec<LineTableEntry>> {
        let mut w = VwpWriter::new();
        w.write_u64(function_id);
        let payload = self.send_command_raw(7, 2, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_u32()?,
            });
        }
        Ok(entries)
    }

    /// Meta.TypeInfo (7, 3)
    pub async fn type_info(&self, type_desc: TypeDesc) -> Result<TypeInfo> {
        let mut w = VwpWriter::new();
        w.write_u64(type_desc);
        let payload = self.send_command_raw(7, 3, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        let name = r.read_string()?;
        let count = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let field_name = r.read_string()?;
            let field_type = r.read_string()?;
            fields.push((field_name, field_type));
        }
        Ok(TypeInfo { name, fields })
    }

    /// Meta.LocationsForLine (7, 4)
    ///
    /// All executable locations the VM knows for a source line. Empty when
    /// the line holds no executable code.
    pub async fn locations_for_line(&self, source_file: &str, line: u32) -> Result<Vec<Location>> {
        let mut w = VwpWriter::new();
        w.write_string(source_file);
        w.write_u32(line);
        let payload = self.send_command_raw(7, 4, w.into_vec()).await?;
        let mut r = VwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut locations = Vec::with_capacity(count);
        for _ in 0..count {
            locations.push(r.read_location()?);
        }
        Ok(locations)
    }
}

fn read_named_values(payload: &[u8]) -> Result<Vec<NamedValue>> {
    let mut r = VwpReader::new(payload);
    let count = r.read_u32()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.read_string()?;
        let declared_type = if r.read_bool()? {
            Some(r.read_string()?)
        } else {
            None
        };
        let value = r.read_value()?;
        values.push(NamedValue {
            name,
            declared_type,
            value,
        });
    }
    Ok(values)
}

/// Filters attached to an `EventRequest.Set` command.
#[derive(Debug)]
pub enum EventModifier {
    /// Restrict a breakpoint request to one code location.
    LocationOnly { location: Location },
    /// Restrict a single-step request to one thread with a given depth.
    Step { thread: ThreadId, depth: StepDepth },
    /// Restrict an exception request by error type name; empty matches all.
    ExceptionMatch { type_name: String, uncaught_only: bool },
    /// Restrict a function-entry request to functions with this exact name.
    FunctionMatch { name: String },
}

impl EventModifier {
    fn encode(self, w: &mut VwpWriter) {
        match self {
            EventModifier::LocationOnly { location } => {
                w.write_u8(1);
                w.write_location(&location);
            }
            EventModifier::Step { thread, depth } => {
                w.write_u8(2);
                w.write_u64(thread);
                w.write_u8(depth.to_wire());
            }
            EventModifier::ExceptionMatch {
                type_name,
                uncaught_only,
            } => {
                w.write_u8(3);
                w.write_string(&type_name);
                w.write_bool(uncaught_only);
            }
            EventModifier::FunctionMatch { name } => {
                w.write_u8(4);
                w.write_string(&name);
            }
        }
    }
}

async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    let mut terminated_with_error = false;

    loop {
        let mut header = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut header) => res,
        };
        if let Err(err) = header_read {
            tracing::debug!(%err, "vwp connection closed");
            terminated_with_error = true;
            break;
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < HEADER_LEN {
            tracing::warn!(length, "vwp packet shorter than its header");
            terminated_with_error = true;
            break;
        }

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        let mut payload = vec![0u8; length - HEADER_LEN];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut payload) => res,
        };
        if payload_read.is_err() {
            terminated_with_error = true;
            break;
        }

        if (flags & FLAG_REPLY) != 0 {
            let error_code = u16::from_be_bytes([header[9], header[10]]);
            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&id)
            };

            if let Some(tx) = tx {
                let _ = tx.send(Ok(Reply {
                    error_code,
                    payload,
                }));
            }
        } else {
            let command_set = header[9];
            let command = header[10];
            if command_set == 64 && command == 100 {
                // Composite event packet.
                if let Err(err) = handle_event_packet(&inner, &payload) {
                    tracing::warn!(%err, "malformed vwp event packet");
                    terminated_with_error = true;
                    break;
                }
            } else {
                // The VM sends no other VM->debugger commands.
                tracing::debug!(id, command_set, command, "ignoring unexpected vm command");
            }
        }
    }

    inner.shutdown.cancel();

    if terminated_with_error {
        let pending = {
            let mut pending = inner.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        for (_id, tx) in pending {
            let _ = tx.send(Err(VwpError::ConnectionClosed));
        }
    }
}

fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<()> {
    let mut r = VwpReader::new(payload);
    let _suspend_policy = r.read_u8()?;
    let event_count = r.read_u32()? as usize;
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        match kind {
            EVENT_KIND_SINGLE_STEP => {
                let thread = r.read_u64()?;
                let location = r.read_location()?;
                let _ = inner.events.send(VwpEvent::SingleStep {
                    request_id,
                    thread,
                    location,
                });
            }
            EVENT_KIND_BREAKPOINT => {
                let thread = r.read_u64()?;
                let location = r.read_location()?;
                let _ = inner.events.send(VwpEvent::Breakpoint {
                    request_id,
                    thread,
                    location,
                });
            }
            EVENT_KIND_EXCEPTION => {
                let thread = r.read_u64()?;
                let exception = r.read_value()?;
                let type_name = r.read_string()?;
                let uncaught = r.read_bool()?;
                let location = r.read_location()?;
                let _ = inner.events.send(VwpEvent::Exception {
                    request_id,
                    thread,
                    exception,
                    type_name,
                    uncaught,
                    location,
                });
            }
            EVENT_KIND_FUNCTION_ENTRY => {
                let thread = r.read_u64()?;
                let location = r.read_location()?;
                let _ = inner.events.send(VwpEvent::FunctionEntry {
                    request_id,
                    thread,
                    location,
                });
            }
            EVENT_KIND_THREAD_DEATH => {
                let thread = r.read_u64()?;
                let _ = request_id;
                let _ = inner.events.send(VwpEvent::ThreadDeath { thread });
            }
            EVENT_KIND_VM_EXIT => {
                let code = r.read_i32()?;
                let _ = request_id;
                let _ = inner.events.send(VwpEvent::VmExit { code });
            }
            other => {
                // Unknown event kind: we cannot know its payload length, so
                // drop the rest of this composite packet.
                tracing::debug!(kind = other, "unknown vwp event kind");
                return Ok(());
            }
        }
    }
    Ok(())
}
