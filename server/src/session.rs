//! Sessions: one per accepted TCP connection.
//!
//! A session owns the association state machine,
//! the DIMSE message assembler and the socket halves.
//! The reader thread frames the inbound byte stream with
//! [`pdu_length`] and submits each complete PDU to the pipeline;
//! from there on, every step runs as a stage job:
//!
//! ```text
//! reader thread -> network_receive -> pdu_decode -> dimse_process
//!        -> storage_query_exec (service handlers)
//!        -> response_encode -> network_send -> socket
//! ```
//!
//! Jobs of one session share its session id,
//! which pins them to one worker per stage
//! and preserves submission order end to end.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use tracing::{debug, info, warn};

use pacs_dimse::command::CommandField;
use pacs_dimse::message::{DimseMessage, MessageAssembler};
use pacs_pipeline::{CancelRegistry, JobCategory, JobContext, PipelineCoordinator, PipelineStage};
use pacs_services::{RequestContext, ServiceRegistry};
use pacs_ul::association::machine::{ScpMachine, ScpOutput};
use pacs_ul::pdu::pool::{PduBufferPool, PooledBuffer};
use pacs_ul::pdu::reader::DecodeError;
use pacs_ul::pdu::{pdu_length, read_pdu, write_pdu, PDataValueType, Pdu, PDU_HEADER_SIZE};

/// The state of one association's connection.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    machine: Mutex<ScpMachine>,
    assembler: Mutex<MessageAssembler>,
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<TcpStream>,
    max_pdu_length: u32,
    strict: bool,
    sequence: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// The request identity for a message on one presentation context,
    /// `None` when the context was never accepted.
    fn request_context(&self, context_id: u8) -> Option<RequestContext> {
        let machine = self.machine.lock().expect("machine lock poisoned");
        let negotiated = machine.negotiated()?;
        let context = negotiated.accepted_context(context_id)?;
        Some(RequestContext {
            session_id: self.id,
            context_id,
            abstract_syntax: context.abstract_syntax.clone(),
            transfer_syntax: context.transfer_syntax.clone(),
            calling_ae_title: negotiated.peer_ae_title.clone(),
            called_ae_title: machine.ae_title().to_string(),
        })
    }

    fn peer_max_pdu_length(&self) -> u32 {
        self.machine
            .lock()
            .expect("machine lock poisoned")
            .peer_max_pdu_length()
    }

    fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer
            .lock()
            .expect("writer lock poisoned")
            .write_all(bytes)
    }
}

/// Holds sessions by id; the weak side of the
/// association/coordinator relationship.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    cancels: Arc<CancelRegistry>,
}

impl SessionRegistry {
    pub fn new(cancels: Arc<CancelRegistry>) -> SessionRegistry {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancels,
        }
    }

    pub fn cancels(&self) -> &Arc<CancelRegistry> {
        &self.cancels
    }

    /// Register a fresh session for an accepted connection.
    pub fn open(
        &self,
        stream: TcpStream,
        machine: ScpMachine,
        max_pdu_length: u32,
        strict: bool,
    ) -> std::io::Result<Arc<Session>> {
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        let session = Arc::new(Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            machine: Mutex::new(machine),
            assembler: Mutex::new(MessageAssembler::new()),
            reader: Mutex::new(Some(stream)),
            writer: Mutex::new(writer),
            max_pdu_length,
            strict,
            sequence: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .insert(session.id, Arc::clone(&session));
        info!("session {} opened for {}", session.id, peer);
        Ok(session)
    }

    /// Close a session's socket and forget it.
    ///
    /// Safe to call more than once.
    pub fn finish(&self, session: &Arc<Session>) {
        if session.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = session
            .writer
            .lock()
            .expect("writer lock poisoned")
            .shutdown(Shutdown::Both);
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .remove(&session.id);
        self.cancels.clear_session(session.id);
        session
            .assembler
            .lock()
            .expect("assembler lock poisoned")
            .clear();
        info!("session {} closed", session.id);
    }

    /// Close every session, e.g. at server shutdown.
    pub fn close_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for session in sessions {
            self.finish(&session);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the response encoding stage turns into wire bytes.
enum Outbound {
    /// an association level PDU (AC, RJ, release, abort)
    Pdu(Pdu),
    /// a DIMSE response message to fragment and send
    Message(DimseMessage),
}

/// Everything the stage jobs of one session need.
#[derive(Clone)]
struct Wiring {
    session: Arc<Session>,
    registry: Arc<ServiceRegistry>,
    sessions: Arc<SessionRegistry>,
}

/// The per-connection reader thread:
/// frames the byte stream and feeds the pipeline.
pub(crate) fn reader_loop(
    session: Arc<Session>,
    pipeline: PipelineCoordinator,
    registry: Arc<ServiceRegistry>,
    sessions: Arc<SessionRegistry>,
) {
    let wiring = Wiring {
        session: Arc::clone(&session),
        registry,
        sessions,
    };

    let Some(mut stream) = session
        .reader
        .lock()
        .expect("reader lock poisoned")
        .take()
    else {
        return;
    };

    let mut buffer = BytesMut::with_capacity((session.max_pdu_length + PDU_HEADER_SIZE) as usize);
    let mut chunk = [0u8; 8192];

    loop {
        if session.is_closed() {
            return;
        }

        // hand off every complete PDU currently buffered;
        // frames ride in pooled buffers and return to the pool
        // once the decode stage is done with them
        while let Some(n) = pdu_length(&buffer) {
            let mut frame = PduBufferPool::global().acquire();
            frame.extend_from_slice(&buffer[..n]);
            buffer.advance(n);
            if !submit_receive(&pipeline, &wiring, frame) {
                return;
            }
        }

        // a hostile length prefix must not make us buffer forever:
        // the decoder classifies over-long PDUs from the header alone
        if buffer.len() >= PDU_HEADER_SIZE as usize {
            if let Err(error) = read_pdu(&buffer, session.max_pdu_length, session.strict) {
                if !error.is_incomplete() {
                    submit_decode_result(&pipeline, &wiring, Err(error));
                    return;
                }
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("session {}: peer closed the connection", session.id);
                wiring.sessions.finish(&session);
                return;
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // idle timeout: let the machine abort the association
                submit_timeout(&pipeline, &wiring);
                return;
            }
            Err(error) => {
                if !session.is_closed() {
                    debug!("session {}: read failed: {}", session.id, error);
                    wiring.sessions.finish(&session);
                }
                return;
            }
        }
    }
}

/// Stage 1: account the received frame, hand off to decoding.
fn submit_receive(
    pipeline: &PipelineCoordinator,
    wiring: &Wiring,
    frame: PooledBuffer<'static>,
) -> bool {
    let context = JobContext::new(
        pipeline.generate_job_id(),
        wiring.session.id(),
        JobCategory::Other,
    )
    .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::NetworkReceive,
        context,
        "network_receive",
        move |pipeline| {
            submit_decode(pipeline, &wiring_for_job, frame);
            Ok(())
        },
    );

    if let Err(error) = submitted {
        warn!(
            "session {}: receive submission failed: {}",
            wiring.session.id(),
            error
        );
        wiring.sessions.finish(&wiring.session);
        return false;
    }
    true
}

/// Stage 2: decode the framed PDU bytes.
fn submit_decode(pipeline: &PipelineCoordinator, wiring: &Wiring, frame: PooledBuffer<'static>) {
    let context = JobContext::new(
        pipeline.generate_job_id(),
        wiring.session.id(),
        JobCategory::Other,
    )
    .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::PduDecode,
        context,
        "pdu_decode",
        move |pipeline| {
            let result = read_pdu(
                &frame,
                wiring_for_job.session.max_pdu_length,
                wiring_for_job.session.strict,
            );
            submit_decode_result(pipeline, &wiring_for_job, result);
            Ok(())
        },
    );

    if submitted.is_err() {
        wiring.sessions.finish(&wiring.session);
    }
}

/// Stage 3: feed the state machine and route its outputs.
fn submit_decode_result(
    pipeline: &PipelineCoordinator,
    wiring: &Wiring,
    result: Result<Pdu, DecodeError>,
) {
    let context = JobContext::new(
        pipeline.generate_job_id(),
        wiring.session.id(),
        JobCategory::Association,
    )
    .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::DimseProcess,
        context,
        "dimse_process",
        move |pipeline| {
            let outputs = {
                let mut machine = wiring_for_job
                    .session
                    .machine
                    .lock()
                    .expect("machine lock poisoned");
                match result {
                    Ok(pdu) => machine.handle_pdu(pdu),
                    Err(error) => machine.handle_decode_error(&error),
                }
            };
            route_outputs(pipeline, &wiring_for_job, outputs);
            Ok(())
        },
    );

    if submitted.is_err() {
        wiring.sessions.finish(&wiring.session);
    }
}

/// The idle timeout path: the machine aborts the association.
fn submit_timeout(pipeline: &PipelineCoordinator, wiring: &Wiring) {
    let context = JobContext::new(
        pipeline.generate_job_id(),
        wiring.session.id(),
        JobCategory::Association,
    )
    .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::DimseProcess,
        context,
        "session_timeout",
        move |pipeline| {
            let outputs = wiring_for_job
                .session
                .machine
                .lock()
                .expect("machine lock poisoned")
                .handle_timeout();
            route_outputs(pipeline, &wiring_for_job, outputs);
            Ok(())
        },
    );

    if submitted.is_err() {
        wiring.sessions.finish(&wiring.session);
    }
}

/// Carry out the state machine's actions, in order.
fn route_outputs(pipeline: &PipelineCoordinator, wiring: &Wiring, outputs: Vec<ScpOutput>) {
    for output in outputs {
        match output {
            ScpOutput::Send(pdu) => {
                submit_outbound(
                    pipeline,
                    wiring,
                    Outbound::Pdu(pdu),
                    JobCategory::Association,
                    0,
                );
            }
            ScpOutput::Command { context_id, data } => {
                let completed = wiring
                    .session
                    .assembler
                    .lock()
                    .expect("assembler lock poisoned")
                    .push_command(context_id, &data);
                handle_assembled(pipeline, wiring, completed);
            }
            ScpOutput::Data { context_id, data } => {
                let completed = wiring
                    .session
                    .assembler
                    .lock()
                    .expect("assembler lock poisoned")
                    .push_data(context_id, data);
                handle_assembled(pipeline, wiring, completed);
            }
            ScpOutput::Closed | ScpOutput::Aborted => {
                submit_close(pipeline, wiring);
            }
        }
    }
}

/// React to the message assembler's outcome:
/// a complete message is dispatched,
/// garbage aborts the association.
fn handle_assembled(
    pipeline: &PipelineCoordinator,
    wiring: &Wiring,
    completed: Result<Option<DimseMessage>, pacs_dimse::Error>,
) {
    match completed {
        Ok(Some(message)) => dispatch_message(pipeline, wiring, message),
        Ok(None) => {}
        Err(error) => {
            warn!(
                "session {}: unusable DIMSE payload: {}",
                wiring.session.id(),
                error
            );
            let outputs = wiring
                .session
                .machine
                .lock()
                .expect("machine lock poisoned")
                .abort();
            route_outputs(pipeline, wiring, outputs);
        }
    }
}

fn category_for(command_field: CommandField) -> JobCategory {
    match command_field {
        CommandField::CEchoRq | CommandField::CEchoRsp => JobCategory::Echo,
        CommandField::CStoreRq | CommandField::CStoreRsp => JobCategory::Store,
        CommandField::CFindRq | CommandField::CFindRsp => JobCategory::Find,
        CommandField::CGetRq | CommandField::CGetRsp => JobCategory::Get,
        CommandField::CMoveRq | CommandField::CMoveRsp => JobCategory::Move,
        CommandField::CCancelRq => JobCategory::Control,
        _ => JobCategory::Other,
    }
}

/// Stage 4: run the service handler for a complete message.
fn dispatch_message(pipeline: &PipelineCoordinator, wiring: &Wiring, message: DimseMessage) {
    // cancellation does not travel to the handlers as a message:
    // it flips the flag the in-flight operation is watching
    if message.command.command_field == CommandField::CCancelRq {
        let target = message.command.message_id_being_responded_to.unwrap_or(0);
        debug!(
            "session {}: C-CANCEL for message {}",
            wiring.session.id(),
            target
        );
        wiring.sessions.cancels().cancel(wiring.session.id(), target);
        return;
    }

    let message_id = message.command.message_id.unwrap_or(0);
    let Some(request_context) = wiring.session.request_context(message.context_id) else {
        warn!(
            "session {}: message on unknown context {}",
            wiring.session.id(),
            message.context_id
        );
        return;
    };

    let category = category_for(message.command.command_field);
    let context = JobContext::new(pipeline.generate_job_id(), wiring.session.id(), category)
        .with_message_id(message_id)
        .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::StorageQueryExec,
        context,
        "storage_query_exec",
        move |pipeline| {
            let wiring = &wiring_for_job;
            let mut responder = |response: DimseMessage| {
                let category = category_for(response.command.command_field);
                if submit_outbound(
                    pipeline,
                    wiring,
                    Outbound::Message(response),
                    category,
                    message_id,
                ) {
                    Ok(())
                } else {
                    pacs_services::RespondSnafu {
                        message: "response submission failed",
                    }
                    .fail()
                }
            };
            wiring
                .registry
                .dispatch(&request_context, message, &mut responder)
                .map_err(|error| {
                    pacs_pipeline::JobFailedSnafu {
                        message: error.to_string(),
                    }
                    .build()
                })
        },
    );

    if submitted.is_err() {
        // the association cannot make progress without its pipeline
        wiring.sessions.finish(&wiring.session);
    }
}

/// Stage 5: turn the outbound into wire bytes,
/// fragmenting DIMSE payloads to the peer's maximum PDU length.
fn submit_outbound(
    pipeline: &PipelineCoordinator,
    wiring: &Wiring,
    outbound: Outbound,
    category: JobCategory,
    message_id: u16,
) -> bool {
    let context = JobContext::new(pipeline.generate_job_id(), wiring.session.id(), category)
        .with_message_id(message_id)
        .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::ResponseEncode,
        context,
        "response_encode",
        move |pipeline| {
            let mut wire = PduBufferPool::global().acquire();
            let encoded = match outbound {
                Outbound::Pdu(pdu) => write_pdu(&mut *wire, &pdu),
                Outbound::Message(message) => {
                    let peer_max = wiring_for_job.session.peer_max_pdu_length();
                    let mut result = Ok(());
                    let command_bytes = message.command.encode();
                    for pdu in pacs_ul::association::pdata::fragment_pdata(
                        message.context_id,
                        PDataValueType::Command,
                        command_bytes,
                        peer_max,
                    ) {
                        result = result.and_then(|()| write_pdu(&mut *wire, &pdu));
                    }
                    if let Some(dataset) = message.dataset {
                        for pdu in pacs_ul::association::pdata::fragment_pdata(
                            message.context_id,
                            PDataValueType::Data,
                            dataset,
                            peer_max,
                        ) {
                            result = result.and_then(|()| write_pdu(&mut *wire, &pdu));
                        }
                    }
                    result
                }
            };
            if let Err(error) = encoded {
                return pacs_pipeline::JobFailedSnafu {
                    message: format!("response encoding failed: {error}"),
                }
                .fail();
            }

            submit_send(pipeline, &wiring_for_job, wire);
            Ok(())
        },
    );

    submitted.is_ok()
}

/// Stage 6: write the bytes to the socket.
fn submit_send(pipeline: &PipelineCoordinator, wiring: &Wiring, wire: PooledBuffer<'static>) {
    let context = JobContext::new(
        pipeline.generate_job_id(),
        wiring.session.id(),
        JobCategory::Other,
    )
    .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::NetworkSend,
        context,
        "network_send",
        move |_| {
            if let Err(error) = wiring_for_job.session.write(&wire) {
                if !wiring_for_job.session.is_closed() {
                    debug!(
                        "session {}: write failed: {}",
                        wiring_for_job.session.id(),
                        error
                    );
                    wiring_for_job.sessions.finish(&wiring_for_job.session);
                }
            }
            Ok(())
        },
    );

    if submitted.is_err() {
        wiring.sessions.finish(&wiring.session);
    }
}

/// Queue the connection close behind the session's pending sends.
///
/// The close travels through the encode stage like a response does:
/// stage queues are FIFO per session,
/// so it reaches the send stage after every pending send
/// and the final PDUs (release or abort) go out first.
fn submit_close(pipeline: &PipelineCoordinator, wiring: &Wiring) {
    let context = JobContext::new(
        pipeline.generate_job_id(),
        wiring.session.id(),
        JobCategory::Association,
    )
    .with_sequence_number(wiring.session.next_sequence());

    let wiring_for_job = wiring.clone();
    let submitted = pipeline.submit_task(
        PipelineStage::ResponseEncode,
        context.clone(),
        "session_close",
        move |pipeline| {
            let wiring = wiring_for_job.clone();
            let submitted = pipeline.submit_task(
                PipelineStage::NetworkSend,
                context,
                "session_close",
                move |_| {
                    wiring.sessions.finish(&wiring.session);
                    Ok(())
                },
            );
            if submitted.is_err() {
                wiring_for_job.sessions.finish(&wiring_for_job.session);
            }
            Ok(())
        },
    );

    if submitted.is_err() {
        wiring.sessions.finish(&wiring.session);
    }
}
