//! The TCP server: accept loop, session handshake, and the per-session
//! command loop that impersonates a local attachment on behalf of a
//! remote client.
//!
//! One task per session. Every attachment the session creates is
//! recorded and detached (restoring in-flight events) on every exit
//! path, clean or broken.

use crate::errors::{EtError, Result, ET_OK};
use crate::net::codec;
use crate::net::types::*;
use crate::system::System;
use crate::station::StationConfig;
use crate::types as t;
use crate::types::{
    modify_from_bits, AttId, BlockMode, Mode, Modify, ParallelPos, Place, Position, RestoreMode,
    SelectMode, UserMode, ATTACHMENTS_MAX, MODE_DUMP, MODE_NOALLOC, NSELECTS, STATIONS_MAX,
    WAIT_ASYNC, WAIT_MASK, WAIT_SLEEP, WAIT_TIMED, WIDTH_LIMIT_32BIT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Poll period of the server-side sleep rewrite; also the bound on
/// wakeup latency.
const SLEEP_POLL: Duration = Duration::from_secs(3);

/// Slice cap per vectored write, the portable IOV_MAX floor.
const IOV_MAX: usize = 16;

/// Accept sessions until the system is killed.
pub async fn serve(system: Arc<System>, listener: TcpListener) -> Result<()> {
    info!(port = system.config().tcp_port, "TCP server listening");
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = system.notify_kill.notified() => {
                info!("TCP server shutting down");
                return Ok(());
            }
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let system = system.clone();
        tokio::spawn(async move {
            debug!(%peer, "client connected");
            if let Err(e) = run_session(system, stream).await {
                debug!(%peer, error = %e, "session ended");
            } else {
                debug!(%peer, "session closed");
            }
        });
    }
}

async fn run_session(system: Arc<System>, mut stream: TcpStream) -> Result<()> {
    if system.config().tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }

    // Anti-portscan gate: three magic words within the probe deadline or
    // the connection is dropped without a word back.
    codec::read_magic_probe(&mut stream).await?;

    // Client descriptor: endian | name-len | bit64 | reserved ×2 | name.
    let words = codec::read_words(&mut stream, HANDSHAKE_REQUEST_WORDS).await?;
    let name_len = words[1] as usize;
    let client_bit64 = words[2] == 1;
    if name_len == 0 || name_len > t::NAME_LENGTH_MAX + 1 {
        return Err(EtError::BadArg);
    }
    let mut name_buf = codec::read_bytes(&mut stream, name_len).await?;
    if name_buf.pop() != Some(0) {
        return Err(EtError::BadArg);
    }
    let wanted = String::from_utf8(name_buf).map_err(|_| EtError::BadArg)?;

    if wanted != system.config().name {
        warn!(%wanted, "client asked for a different system");
        codec::write_words(&mut stream, &[EtError::Error.code() as u32]).await?;
        return Err(EtError::BadArg);
    }

    let reply = [
        ET_OK as u32,
        local_endian(),
        system.config().nevents as u32,
        hi(system.config().event_size),
        lo(system.config().event_size),
        VERSION,
        NSELECTS as u32,
        LANG_NATIVE,
        local_bit64(),
        0,
    ];
    codec::write_words(&mut stream, &reply).await?;

    let nevents = system.config().nevents;
    let mut session = Session {
        system,
        stream,
        client_bit64,
        attaches: Vec::new(),
        place_scratch: Vec::with_capacity(nevents),
    };
    let out = session.command_loop().await;
    session.detach_all().await;
    out
}

struct Session {
    system: Arc<System>,
    stream: TcpStream,
    client_bit64: bool,
    /// Attachments created over this session, detached on any exit.
    attaches: Vec<AttId>,
    /// Per-command place buffer, sized to the pool once at session
    /// start.
    place_scratch: Vec<Place>,
}

enum Flow {
    Continue,
    /// Clean end (close/kill); no detour through the error reply.
    Quit,
}

impl Session {
    async fn detach_all(&mut self) {
        for att in std::mem::take(&mut self.attaches) {
            if let Err(e) = self.system.detach(att).await {
                warn!(att, error = %e, "detach on session end failed");
            }
        }
    }

    async fn command_loop(&mut self) -> Result<()> {
        loop {
            let cmd = tokio::select! {
                r = codec::read_word(&mut self.stream) => r?,
                _ = self.system.notify_kill.notified() => return Ok(()),
            };
            match self.dispatch_command(cmd).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    async fn dispatch_command(&mut self, cmd: u32) -> Result<Flow> {
        if cmd < STAT_GATTS {
            return self.mixed_command(cmd).await;
        }
        if cmd < STAT_SBLOCK {
            self.station_getter(cmd).await?;
        } else if cmd < ATT_PUT {
            self.station_setter(cmd).await?;
        } else if cmd < SYS_TMP {
            self.attachment_counter(cmd).await?;
        } else if cmd <= SYS_GRP {
            self.system_getter(cmd).await?;
        } else if cmd <= SYS_GRPS {
            self.system_dump(cmd).await?;
        } else {
            warn!(cmd, "bad command value");
            return Err(EtError::BadArg);
        }
        Ok(Flow::Continue)
    }

    // =========================================================================
    // EVENT TRANSFER AND MIXED COMMANDS
    // =========================================================================

    async fn mixed_command(&mut self, cmd: u32) -> Result<Flow> {
        match cmd {
            EV_GET => self.ev_get().await?,
            EVS_GET => self.evs_get().await?,
            EV_PUT => self.ev_put().await?,
            EVS_PUT => self.evs_put().await?,
            EV_NEW => self.ev_new().await?,
            EVS_NEW => self.evs_new(false).await?,
            EVS_NEW_GRP => self.evs_new(true).await?,
            EV_DUMP => self.ev_dump().await?,
            EVS_DUMP => self.evs_dump().await?,

            ALIVE => {
                // Alive by definition: this loop runs inside the broker.
                codec::write_words(&mut self.stream, &[1]).await?;
            }
            WAIT_ALIVE => {
                codec::write_words(&mut self.stream, &[ET_OK as u32]).await?;
            }
            CLOSE | FCLOSE => {
                // No reply; the caller just closes its socket.
                debug!("remote client closing");
                return Ok(Flow::Quit);
            }
            WAKE_ATT => {
                let att = codec::read_word(&mut self.stream).await? as AttId;
                let _ = self.system.wake_attachment(att);
            }
            WAKE_ALL => {
                let stat = codec::read_word(&mut self.stream).await? as usize;
                let _ = self.system.wake_station(stat);
            }
            KILL => {
                self.system.kill();
                return Ok(Flow::Quit);
            }

            STAT_ATT => self.stat_attach().await?,
            STAT_DET => self.stat_detach().await?,
            STAT_CRAT => self.stat_create().await?,
            STAT_RM => {
                let stat = codec::read_word(&mut self.stream).await? as usize;
                self.reply_status(self.system.station_remove(stat)).await?;
            }
            STAT_SPOS => {
                let w = codec::read_words(&mut self.stream, 3).await?;
                let r = Position::from_i32(w[1] as i32)
                    .and_then(|pos| {
                        ParallelPos::from_i32(w[2] as i32)
                            .and_then(|ppos| self.system.station_set_position(w[0] as usize, pos, ppos))
                    });
                self.reply_status(r).await?;
            }
            STAT_GPOS => {
                let stat = codec::read_word(&mut self.stream).await? as usize;
                let reply = match self.system.station_position(stat) {
                    Ok((pos, ppos)) => [ET_OK as u32, pos as u32, ppos as u32],
                    Err(e) => [e.code() as u32, 0, 0],
                };
                codec::write_words(&mut self.stream, &reply).await?;
            }
            STAT_ISAT => {
                let w = codec::read_words(&mut self.stream, 2).await?;
                let reply = match self.system.is_attached(w[0] as usize, w[1] as usize) {
                    Ok(attached) => (attached as i32) as u32,
                    Err(e) => e.code() as u32,
                };
                codec::write_words(&mut self.stream, &[reply]).await?;
            }
            STAT_EX => {
                let name = codec::read_cstr(&mut self.stream, t::STATION_NAME_MAX + 1).await?;
                let reply = match self.system.station_find(&name) {
                    Some(id) => [1, id as u32],
                    None => [0, 0],
                };
                codec::write_words(&mut self.stream, &reply).await?;
            }
            STAT_SSW => {
                let w = codec::read_words(&mut self.stream, 1 + NSELECTS).await?;
                let r = self.system.station(w[0] as usize).map(|st| {
                    let mut cfg = st.config();
                    for i in 0..NSELECTS {
                        cfg.select[i] = w[1 + i] as i32;
                    }
                });
                self.reply_status(r).await?;
            }
            STAT_GSW => {
                let stat = codec::read_word(&mut self.stream).await? as usize;
                let mut reply = [0u32; 1 + NSELECTS];
                match self.system.station(stat) {
                    Ok(st) => {
                        let cfg = st.config();
                        reply[0] = ET_OK as u32;
                        for i in 0..NSELECTS {
                            reply[1 + i] = cfg.select[i] as u32;
                        }
                    }
                    Err(e) => reply[0] = e.code() as u32,
                }
                codec::write_words(&mut self.stream, &reply).await?;
            }
            STAT_LIB | STAT_FUNC | STAT_CLASS => {
                let stat = codec::read_word(&mut self.stream).await? as usize;
                match self.system.station(stat) {
                    Ok(st) => {
                        let cfg = st.config();
                        let s = match cmd {
                            STAT_LIB => cfg.lib.clone(),
                            STAT_FUNC => cfg.function.clone(),
                            _ => cfg.class.clone(),
                        };
                        drop(cfg);
                        let mut frame = Vec::with_capacity(12 + s.len());
                        codec::put_word(&mut frame, ET_OK as u32);
                        codec::put_cstr(&mut frame, &s);
                        codec::write_all(&mut self.stream, &frame).await?;
                    }
                    Err(e) => {
                        codec::write_words(&mut self.stream, &[e.code() as u32, 0]).await?;
                    }
                }
            }

            _ => {
                warn!(cmd, "bad command value");
                return Err(EtError::BadArg);
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply_status(&mut self, r: Result<()>) -> Result<()> {
        let word = match r {
            Ok(()) => ET_OK as u32,
            Err(e) => e.code() as u32,
        };
        codec::write_words(&mut self.stream, &[word]).await
    }

    /// Probe the session socket without consuming data. Used between
    /// sleep-rewrite rounds: a readable socket while no reply is owed
    /// means the peer died (EOF) or broke protocol, either way the
    /// session is over.
    async fn peer_vanished(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(1), self.stream.peek(&mut probe)).await {
            Err(_) => false,
            Ok(Ok(0)) => true,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => true,
        }
    }

    /// Run a blocking acquisition per the requested wait mode. A remote
    /// `Sleep` must not park this task for good; it is rewritten as
    /// repeated 3-second timed waits with a socket liveness probe in
    /// between, so wake-attachment and peer death both unwind promptly.
    async fn acquire<F, Fut>(&mut self, wait: i32, delta: Duration, op: F) -> Result<Vec<Place>>
    where
        F: Fn(Arc<System>, Mode) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Place>>>,
    {
        match wait {
            WAIT_ASYNC => op(self.system.clone(), Mode::Async).await,
            WAIT_TIMED => op(self.system.clone(), Mode::Timed(delta)).await,
            WAIT_SLEEP => loop {
                match op(self.system.clone(), Mode::Timed(SLEEP_POLL)).await {
                    Err(EtError::Timeout) => {
                        if self.peer_vanished().await {
                            return Err(EtError::Read);
                        }
                    }
                    other => return other,
                }
            },
            _ => Err(EtError::BadArg),
        }
    }

    async fn ev_get(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 5).await?;
        let att = w[0] as AttId;
        let wait = (w[1] as i32) & WAIT_MASK;
        let bits = w[2] as i32;
        let dump = bits & MODE_DUMP != 0;
        let modify = modify_from_bits(bits);
        let delta = Duration::new(w[3] as u64, w[4]);

        let places = match self
            .acquire(wait, delta, |sys, mode| async move {
                sys.get_events(att, mode, 1).await
            })
            .await
        {
            Ok(p) => p,
            Err(e) => {
                codec::write_words(&mut self.stream, &[e.code() as u32]).await?;
                return Ok(());
            }
        };
        self.stream_events(att, &places, modify, dump, false).await
    }

    async fn evs_get(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 6).await?;
        let att = w[0] as AttId;
        let wait = (w[1] as i32) & WAIT_MASK;
        let bits = w[2] as i32;
        let num = (w[3] as usize).clamp(1, self.system.pool().len());
        let dump = bits & MODE_DUMP != 0;
        let modify = modify_from_bits(bits);
        let delta = Duration::new(w[4] as u64, w[5]);

        let places = match self
            .acquire(wait, delta, |sys, mode| async move {
                sys.get_events(att, mode, num).await
            })
            .await
        {
            Ok(p) => p,
            Err(e) => {
                codec::write_words(&mut self.stream, &[e.code() as u32]).await?;
                return Ok(());
            }
        };
        self.stream_events(att, &places, modify, dump, true).await
    }

    /// Stream gotten events to the client: width guard, headers,
    /// payloads, and the automatic put-back for read-only transfers.
    async fn stream_events(
        &mut self,
        att: AttId,
        places: &[Place],
        modify: Modify,
        dump: bool,
        batch: bool,
    ) -> Result<()> {
        // A 32-bit peer cannot address what it cannot represent; put the
        // whole batch back untouched and report TooBig.
        if local_bit64() == 1 && !self.client_bit64 {
            let mut sum: u64 = 0;
            for &place in places {
                sum += self.system.pool().event(place)?.length;
            }
            if sum > WIDTH_LIMIT_32BIT {
                if dump {
                    self.system.dump_events(att, places).await?;
                } else {
                    self.system.put_events(att, places).await?;
                }
                codec::write_words(&mut self.stream, &[EtError::TooBig.code() as u32]).await?;
                return Ok(());
            }
        }

        let mut heads: Vec<Vec<u8>> = Vec::with_capacity(places.len() + 1);
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(places.len());
        let mut total: u64 = 0;

        for &place in places {
            let mut ev = self.system.pool().event(place)?;
            ev.modify = modify;
            let mut head = Vec::with_capacity(EVENT_HEADER_WORDS * 4);
            codec::put_word(&mut head, hi(ev.length));
            codec::put_word(&mut head, lo(ev.length));
            codec::put_word(&mut head, hi(ev.memsize()));
            codec::put_word(&mut head, lo(ev.memsize()));
            codec::put_word(
                &mut head,
                (ev.priority.to_i32() | (ev.datastatus.to_i32() << t::DATA_SHIFT)) as u32,
            );
            codec::put_word(&mut head, ev.place() as u32);
            codec::put_word(&mut head, 0);
            codec::put_word(&mut head, ev.byteorder);
            codec::put_word(&mut head, 0);
            for i in 0..NSELECTS {
                codec::put_word(&mut head, ev.control[i] as u32);
            }
            total += (EVENT_HEADER_WORDS * 4) as u64 + ev.length;
            payloads.push(ev.data()[..ev.length as usize].to_vec());
            heads.push(head);
        }

        let mut lead = Vec::with_capacity(12);
        if batch {
            codec::put_word(&mut lead, places.len() as u32);
            codec::put_word(&mut lead, hi(total));
            codec::put_word(&mut lead, lo(total));
        } else {
            codec::put_word(&mut lead, ET_OK as u32);
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + places.len() * 2);
        parts.push(&lead);
        for i in 0..places.len() {
            parts.push(&heads[i]);
            parts.push(&payloads[i]);
        }
        codec::write_vectored_all(&mut self.stream, &parts, IOV_MAX).await?;

        // Read-only transfer: the client never puts these back, do it
        // for them.
        if modify == Modify::None {
            if dump {
                self.system.dump_events(att, places).await?;
            } else {
                self.system.put_events(att, places).await?;
            }
        }
        Ok(())
    }

    async fn ev_put(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 1 + PUT_HEADER_WORDS).await?;
        let att = w[0] as AttId;
        let place = self.read_put_header(&w[1..]).await?;
        let r = self.system.put_events(att, &[place]).await;
        self.reply_status(r).await
    }

    async fn evs_put(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 4).await?;
        let att = w[0] as AttId;
        let count = (w[1] as usize).min(self.system.pool().len());

        self.place_scratch.clear();
        for _ in 0..count {
            let head = codec::read_words(&mut self.stream, PUT_HEADER_WORDS).await?;
            let place = self.read_put_header(&head).await?;
            self.place_scratch.push(place);
        }
        let places = std::mem::take(&mut self.place_scratch);
        let r = self.system.put_events(att, &places).await;
        self.place_scratch = places;
        self.reply_status(r).await
    }

    /// Decode one put header, apply it to the event, and read the
    /// payload when the event was checked out for full modification.
    async fn read_put_header(&mut self, head: &[u32]) -> Result<Place> {
        let place = head[0] as Place;
        let length = join(head[2], head[3]);
        let pristat = head[4] as i32;
        let byteorder = head[5];

        let wants_payload = {
            let mut ev = self.system.pool().event(place)?;
            ev.set_length(length)?;
            ev.priority = t::Priority::from_i32(pristat & t::PRIORITY_MASK);
            ev.datastatus = t::DataStatus::from_i32((pristat & t::DATA_MASK) >> t::DATA_SHIFT);
            ev.byteorder = byteorder;
            for i in 0..NSELECTS {
                ev.control[i] = head[7 + i] as i32;
            }
            ev.modify == Modify::Full
        };

        if wants_payload {
            let payload = codec::read_bytes(&mut self.stream, length as usize).await?;
            let mut ev = self.system.pool().event(place)?;
            ev.data_mut()[..payload.len()].copy_from_slice(&payload);
        }
        Ok(place)
    }

    async fn ev_new(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 6).await?;
        let att = w[0] as AttId;
        let mode = w[1] as i32;
        let wait = mode & WAIT_MASK;
        let no_alloc = mode & MODE_NOALLOC != 0;
        let size = join(w[2], w[3]);
        let delta = Duration::new(w[4] as u64, w[5]);

        // A 32-bit broker cannot back a 64-bit client's giant request.
        if local_bit64() == 0 && self.client_bit64 && size > WIDTH_LIMIT_32BIT {
            codec::write_words(&mut self.stream, &[EtError::TooBig.code() as u32, 0, 0]).await?;
            return Ok(());
        }

        let result = self
            .acquire(wait, delta, |sys, m| async move {
                sys.new_events(att, m, size, 1, None, no_alloc).await
            })
            .await;

        let reply = match result {
            Ok(places) => {
                self.system.pool().event(places[0])?.modify = Modify::Full;
                [ET_OK as u32, places[0] as u32, 0]
            }
            Err(e) => [e.code() as u32, 0, 0],
        };
        codec::write_words(&mut self.stream, &reply).await
    }

    async fn evs_new(&mut self, grouped: bool) -> Result<()> {
        let nwords = if grouped { 8 } else { 7 };
        let w = codec::read_words(&mut self.stream, nwords).await?;
        let att = w[0] as AttId;
        let mode = w[1] as i32;
        let wait = mode & WAIT_MASK;
        let no_alloc = mode & MODE_NOALLOC != 0;
        let size = join(w[2], w[3]);
        let num = (w[4] as usize).min(self.system.pool().len());
        let (group, delta) = if grouped {
            // Groups are numbered from 1 on the wire.
            let g = w[5] as usize;
            if g == 0 || g > self.system.group_quotas().len() {
                codec::write_words(&mut self.stream, &[EtError::BadArg.code() as u32]).await?;
                return Ok(());
            }
            (Some(g - 1), Duration::new(w[6] as u64, w[7]))
        } else {
            (None, Duration::new(w[5] as u64, w[6]))
        };

        if local_bit64() == 0 && self.client_bit64 && (num as u64).saturating_mul(size) > WIDTH_LIMIT_32BIT {
            codec::write_words(&mut self.stream, &[EtError::TooBig.code() as u32]).await?;
            return Ok(());
        }

        let result = self
            .acquire(wait, delta, |sys, m| async move {
                sys.new_events(att, m, size, num, group, no_alloc).await
            })
            .await;

        match result {
            Ok(places) => {
                let mut reply = Vec::with_capacity(1 + places.len());
                reply.push(places.len() as u32);
                for &p in &places {
                    self.system.pool().event(p)?.modify = Modify::Full;
                    reply.push(p as u32);
                }
                codec::write_words(&mut self.stream, &reply).await
            }
            Err(e) => codec::write_words(&mut self.stream, &[e.code() as u32]).await,
        }
    }

    async fn ev_dump(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 2).await?;
        let r = self.system.dump_events(w[0] as AttId, &[w[1] as Place]).await;
        self.reply_status(r).await
    }

    async fn evs_dump(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 2).await?;
        let att = w[0] as AttId;
        let count = (w[1] as usize).min(self.system.pool().len());
        let places_raw = codec::read_words(&mut self.stream, count).await?;
        let places: Vec<Place> = places_raw.iter().map(|&p| p as Place).collect();
        let r = self.system.dump_events(att, &places).await;
        self.reply_status(r).await
    }

    // =========================================================================
    // STATION COMMANDS WITH IRREGULAR FRAMES
    // =========================================================================

    async fn stat_attach(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 4).await?;
        let stat = w[0] as usize;
        let pid = w[1];
        let host_len = w[2] as usize;
        let iface_len = w[3] as usize;
        let host = self.read_fixed_cstr(host_len).await?;
        let iface = self.read_fixed_cstr(iface_len).await?;

        let reply = match self.system.attach(stat, pid, &host, &iface) {
            Ok(att) => {
                self.attaches.push(att);
                [ET_OK as u32, att as u32]
            }
            Err(e) => [e.code() as u32, 0],
        };
        codec::write_words(&mut self.stream, &reply).await
    }

    async fn stat_detach(&mut self) -> Result<()> {
        let att = codec::read_word(&mut self.stream).await? as AttId;
        let r = self.system.detach(att).await;
        if r.is_ok() {
            self.attaches.retain(|&a| a != att);
        }
        self.reply_status(r).await
    }

    async fn stat_create(&mut self) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 14 + NSELECTS).await?;
        // w[0] is the config-initialized marker, meaningful only to the
        // original's shared-memory layout; accepted and ignored.
        let mut config = StationConfig::default();
        let decoded = (|| -> Result<()> {
            config.flow_mode = t::FlowMode::from_i32(w[1] as i32)?;
            config.user_mode = UserMode::from_i32(w[2] as i32)?;
            config.restore_mode = RestoreMode::from_i32(w[3] as i32)?;
            config.block_mode = BlockMode::from_i32(w[4] as i32)?;
            config.prescale = w[5];
            config.cue = w[6] as usize;
            config.select_mode = SelectMode::from_i32(w[7] as i32)?;
            for i in 0..NSELECTS {
                config.select[i] = w[8 + i] as i32;
            }
            Ok(())
        })();

        let len_func = w[8 + NSELECTS] as usize;
        let len_lib = w[9 + NSELECTS] as usize;
        let len_class = w[10 + NSELECTS] as usize;
        let len_name = w[11 + NSELECTS] as usize;
        let position = w[12 + NSELECTS] as i32;
        let pposition = w[13 + NSELECTS] as i32;

        config.function = self.read_fixed_cstr(len_func).await?;
        config.lib = self.read_fixed_cstr(len_lib).await?;
        config.class = self.read_fixed_cstr(len_class).await?;
        let name = self.read_fixed_cstr(len_name).await?;

        let result = decoded
            .and_then(|()| Position::from_i32(position))
            .and_then(|pos| {
                let ppos = ParallelPos::from_i32(pposition)?;
                self.system.station_create_at(&name, config, pos, ppos)
            });

        let reply = match result {
            Ok(id) => [ET_OK as u32, id as u32],
            // A duplicate name still reports the existing id.
            Err(EtError::Exists(id)) => [EtError::Exists(id).code() as u32, id as u32],
            Err(e) => [e.code() as u32, 0],
        };
        codec::write_words(&mut self.stream, &reply).await
    }

    /// Read a NUL-terminated string of an exact on-wire length (no
    /// length prefix of its own; zero length means absent).
    async fn read_fixed_cstr(&mut self, len: usize) -> Result<String> {
        if len == 0 {
            return Ok(String::new());
        }
        if len > t::HOSTNAME_MAX {
            return Err(EtError::BadArg);
        }
        let mut buf = codec::read_bytes(&mut self.stream, len).await?;
        if buf.pop() != Some(0) {
            return Err(EtError::BadArg);
        }
        String::from_utf8(buf).map_err(|_| EtError::BadArg)
    }

    // =========================================================================
    // RANGE-DISPATCHED QUERY COMMANDS
    // =========================================================================

    async fn station_getter(&mut self, cmd: u32) -> Result<()> {
        let stat = codec::read_word(&mut self.stream).await? as usize;
        let value = self.system.station(stat).map(|st| match cmd {
            STAT_GATTS => st.lists().attachments.len() as u32,
            STAT_STATUS => st.lists().state.to_i32() as u32,
            STAT_INCNT => st.lists().input.len() as u32,
            STAT_OUTCNT => st.lists().output.len() as u32,
            STAT_GBLOCK => st.config().block_mode.to_i32() as u32,
            STAT_GUSER => st.config().user_mode.to_i32() as u32,
            STAT_GRESTORE => st.config().restore_mode.to_i32() as u32,
            STAT_GPRE => st.config().prescale,
            STAT_GCUE => st.config().cue as u32,
            _ => st.config().select_mode.to_i32() as u32,
        });
        let reply = match value {
            Ok(v) => [ET_OK as u32, v],
            Err(e) => [e.code() as u32, 0],
        };
        codec::write_words(&mut self.stream, &reply).await
    }

    async fn station_setter(&mut self, cmd: u32) -> Result<()> {
        let w = codec::read_words(&mut self.stream, 2).await?;
        let val = w[1] as i32;
        let nevents = self.system.pool().len();
        let r = self.system.station(w[0] as usize).and_then(|st| {
            let mut cfg = st.config();
            match cmd {
                STAT_SBLOCK => cfg.block_mode = BlockMode::from_i32(val)?,
                STAT_SUSER => cfg.user_mode = UserMode::from_i32(val)?,
                STAT_SRESTORE => cfg.restore_mode = RestoreMode::from_i32(val)?,
                STAT_SPRE => {
                    if val < 1 {
                        return Err(EtError::BadArg);
                    }
                    cfg.prescale = val as u32;
                }
                STAT_SCUE => {
                    if val < 1 || val as usize > nevents {
                        return Err(EtError::BadArg);
                    }
                    cfg.cue = val as usize;
                }
                _ => return Err(EtError::BadArg),
            }
            drop(cfg);
            // Producers blocked on the old cue may fit now.
            st.notify_space.notify_waiters();
            Ok(())
        });
        self.reply_status(r).await
    }

    async fn attachment_counter(&mut self, cmd: u32) -> Result<()> {
        let att_id = codec::read_word(&mut self.stream).await? as AttId;
        let value = self.system.attachment(att_id).map(|att| {
            let counter = match cmd {
                ATT_PUT => &att.events_put,
                ATT_GET => &att.events_get,
                ATT_DUMP => &att.events_dump,
                _ => &att.events_make,
            };
            counter.load(std::sync::atomic::Ordering::Relaxed)
        });
        let reply = match value {
            Ok(v) => [ET_OK as u32, hi(v), lo(v)],
            Err(e) => [e.code() as u32, 0, 0],
        };
        codec::write_words(&mut self.stream, &reply).await
    }

    async fn system_getter(&mut self, cmd: u32) -> Result<()> {
        let value: u32 = match cmd {
            SYS_TMP => self.system.pool().oversized_count() as u32,
            SYS_TMPMAX => self.system.pool().oversized_max() as u32,
            SYS_STAT => self.system.station_count() as u32,
            SYS_STATMAX => STATIONS_MAX as u32,
            // Local-process bookkeeping has no counterpart here; remote
            // clients are sessions, not mapped processes.
            SYS_PROC => 0,
            SYS_PROCMAX => 0,
            SYS_ATT => self.system.attachment_count() as u32,
            SYS_ATTMAX => ATTACHMENTS_MAX as u32,
            SYS_HBEAT => self.system.heartbeat() as u32,
            SYS_PID => std::process::id(),
            SYS_GRP => self.system.group_quotas().len() as u32,
            _ => return Err(EtError::BadArg),
        };
        codec::write_words(&mut self.stream, &[ET_OK as u32, value]).await
    }

    async fn system_dump(&mut self, cmd: u32) -> Result<()> {
        match cmd {
            SYS_GRPS => {
                let quotas = self.system.group_quotas().to_vec();
                let mut reply = Vec::with_capacity(1 + quotas.len());
                reply.push(quotas.len() as u32);
                reply.extend(quotas.iter().map(|&q| q as u32));
                codec::write_words(&mut self.stream, &reply).await
            }
            // The full-state and histogram dumps mirror the original's
            // shared-memory structs and are not served.
            SYS_DATA | SYS_HIST => {
                codec::write_words(&mut self.stream, &[EtError::Error.code() as u32]).await
            }
            _ => Err(EtError::BadArg),
        }
    }
}
