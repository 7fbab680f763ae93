//! Remote client: a broker session over one TCP connection.
//!
//! All traffic for a session flows through a single socket guarded by an
//! async mutex; each request holds the lock across its write and reply.
//! Long blocking waits never hold the lock across the server's wait:
//! `Sleep` is sent as repeated short `Timed` requests with small gaps,
//! and a `Timed` wait over a second is split the same way, so a
//! wake-attachment issued from another task can always slip in between
//! rounds.

use crate::config::OpenConfig;
use crate::errors::{EtError, Result};
use crate::net::codec;
use crate::net::discovery::{self, Response};
use crate::net::iface;
use crate::net::sock;
use crate::net::types::*;
use crate::station::StationConfig;
use crate::types::{
    modify_to_bits, AttId, BlockMode, CastMode, DataStatus, HostSpec, Mode, Modify, ParallelPos,
    Place, Position, Priority, RestoreMode, SelectMode, StatId, StationState, UserMode, DATA_MASK,
    DATA_SHIFT, MODE_DUMP, MODE_NOALLOC, NSELECTS, PRIORITY_MASK, WAIT_ASYNC, WAIT_TIMED,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Duration of each rewritten wait round.
const ROUND_WAIT: Duration = Duration::from_millis(200);

/// Gap between rounds, leaving the session lock free for wake calls.
const ROUND_GAP: Duration = Duration::from_millis(10);

/// Retry pace while `open` waits for a broker to appear.
const OPEN_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// An event as seen by a remote client: the header fields plus a local
/// payload buffer. `place` is the only identity that goes back on the
/// wire.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub place: Place,
    pub length: u64,
    pub memsize: u64,
    pub priority: Priority,
    pub datastatus: DataStatus,
    pub byteorder: u32,
    pub control: [i32; NSELECTS],
    pub modify: Modify,
    pub data: Vec<u8>,
}

impl RemoteEvent {
    /// Set payload bytes and length together.
    pub fn set_data(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.memsize {
            return Err(EtError::TooBig);
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.length = bytes.len() as u64;
        Ok(())
    }
}

/// One open broker session.
pub struct Remote {
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
    nevents: usize,
    event_size: u64,
    server_bit64: bool,
    local_addr: Option<SocketAddr>,
    host: String,
}

impl Remote {
    // =========================================================================
    // OPEN / CLOSE
    // =========================================================================

    /// Find and open the broker named `name` per the open config:
    /// direct connection, or discovery plus the subnet-ordered connect
    /// walk, retried until the configured wait budget runs out.
    pub async fn open(name: &str, config: &OpenConfig) -> Result<Remote> {
        let start = tokio::time::Instant::now();
        loop {
            match Self::open_once(name, config).await {
                Ok(remote) => return Ok(remote),
                // A policy violation will not fix itself by waiting.
                Err(EtError::TooMany) => return Err(EtError::TooMany),
                Err(e) => {
                    let budget = match config.wait {
                        Some(w) => w,
                        None => return Err(e),
                    };
                    if start.elapsed() >= budget {
                        return Err(e);
                    }
                    debug!(error = %e, "broker not reachable yet, retrying");
                    tokio::time::sleep(OPEN_RETRY_PAUSE).await;
                }
            }
        }
    }

    async fn open_once(name: &str, config: &OpenConfig) -> Result<Remote> {
        let (stream, host) = match config.cast {
            CastMode::Direct => {
                let host = match &config.host {
                    HostSpec::Host(h) => h.clone(),
                    // A direct connection to "local" means loopback.
                    HostSpec::Local | HostSpec::Anywhere => "127.0.0.1".to_string(),
                    HostSpec::Remote => return Err(EtError::BadArg),
                };
                let ip = iface::resolve_host(&host).await?[0];
                let stream = sock::tcp_connect(
                    SocketAddr::new(ip.into(), config.server_port),
                    config.interface.and_then(iface::matching_local_ip),
                    config.tcp_nodelay,
                    config.tcp_send_buf,
                    config.tcp_recv_buf,
                    Some(Duration::from_secs(3)),
                )
                .await?;
                (stream, host)
            }
            _ => {
                let response: Response = discovery::find_broker(name, config).await?;
                let (stream, addr) = discovery::connect_to_response(&response, config).await?;
                (stream, addr.to_string())
            }
        };

        let mut remote = Remote {
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            nevents: 0,
            event_size: 0,
            server_bit64: true,
            local_addr: None,
            host,
        };
        remote.handshake(name).await?;
        Ok(remote)
    }

    async fn handshake(&mut self, name: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        self.local_addr = stream.local_addr().ok();

        let mut frame = Vec::with_capacity(64);
        for m in MAGIC {
            codec::put_word(&mut frame, m);
        }
        codec::put_word(&mut frame, local_endian());
        codec::put_word(&mut frame, name.len() as u32 + 1);
        codec::put_word(&mut frame, local_bit64());
        codec::put_word(&mut frame, 0);
        codec::put_word(&mut frame, 0);
        frame.extend_from_slice(name.as_bytes());
        frame.push(0);
        codec::write_all(&mut *stream, &frame).await?;

        let reply = codec::read_words(&mut *stream, HANDSHAKE_REPLY_WORDS).await?;
        if let Some(e) = EtError::from_code(reply[0] as i32) {
            return Err(e);
        }
        if reply[5] != VERSION {
            info!(server = reply[5], client = VERSION, "version mismatch");
            return Err(EtError::Error);
        }
        if reply[6] as usize != NSELECTS {
            info!(server = reply[6], client = NSELECTS, "selection-int width mismatch");
            return Err(EtError::Error);
        }
        self.nevents = reply[2] as usize;
        self.event_size = join(reply[3], reply[4]);
        self.server_bit64 = reply[8] == 1;

        info!(host = %self.host, nevents = self.nevents, event_size = self.event_size, "broker opened");
        Ok(())
    }

    pub fn nevents(&self) -> usize {
        self.nevents
    }

    pub fn event_size(&self) -> u64 {
        self.event_size
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the broker side runs a 64-bit word width; transfers a
    /// 32-bit side cannot represent are refused with `TooBig`.
    pub fn server_bit64(&self) -> bool {
        self.server_bit64
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) { Err(EtError::Closed) } else { Ok(()) }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, TcpStream>> {
        self.check_open()?;
        Ok(self.stream.lock().await)
    }

    /// Fixed-shape request/reply exchange under the session lock.
    async fn rpc(&self, request: &[u32], reply_words: usize) -> Result<Vec<u32>> {
        let mut stream = self.lock().await?;
        codec::write_words(&mut *stream, request).await?;
        codec::read_words(&mut *stream, reply_words).await
    }

    /// One-word-status reply variant.
    async fn rpc_status(&self, request: &[u32]) -> Result<()> {
        let reply = self.rpc(request, 1).await?;
        match EtError::from_code(reply[0] as i32) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fire-and-forget command (the server sends no reply).
    async fn send_only(&self, request: &[u32]) -> Result<()> {
        let mut stream = self.lock().await?;
        codec::write_words(&mut *stream, request).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send_only(&[CLOSE]).await?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn forced_close(&self) -> Result<()> {
        self.send_only(&[FCLOSE]).await?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Bring the whole broker down.
    pub async fn kill(&self) -> Result<()> {
        self.send_only(&[KILL]).await?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn alive(&self) -> Result<bool> {
        let reply = self.rpc(&[ALIVE], 1).await?;
        Ok(reply[0] == 1)
    }

    pub async fn wait_for_alive(&self) -> Result<()> {
        self.rpc_status(&[WAIT_ALIVE]).await
    }

    pub async fn wake_attachment(&self, att: AttId) -> Result<()> {
        self.send_only(&[WAKE_ATT, att as u32]).await
    }

    pub async fn wake_station(&self, stat: StatId) -> Result<()> {
        self.send_only(&[WAKE_ALL, stat as u32]).await
    }

    // =========================================================================
    // STATIONS
    // =========================================================================

    pub async fn station_create_at(
        &self,
        name: &str,
        config: &StationConfig,
        position: Position,
        ppos: ParallelPos,
    ) -> Result<StatId> {
        let mut frame = Vec::with_capacity(128);
        codec::put_word(&mut frame, STAT_CRAT);
        codec::put_word(&mut frame, 1); // initialized marker
        codec::put_word(&mut frame, config.flow_mode.to_i32() as u32);
        codec::put_word(&mut frame, config.user_mode.to_i32() as u32);
        codec::put_word(&mut frame, config.restore_mode.to_i32() as u32);
        codec::put_word(&mut frame, config.block_mode.to_i32() as u32);
        codec::put_word(&mut frame, config.prescale);
        codec::put_word(&mut frame, config.cue as u32);
        codec::put_word(&mut frame, config.select_mode.to_i32() as u32);
        for i in 0..NSELECTS {
            codec::put_word(&mut frame, config.select[i] as u32);
        }
        for s in [&config.function, &config.lib, &config.class] {
            codec::put_word(&mut frame, if s.is_empty() { 0 } else { s.len() as u32 + 1 });
        }
        codec::put_word(&mut frame, name.len() as u32 + 1);
        codec::put_word(&mut frame, position.to_i32() as u32);
        codec::put_word(&mut frame, ppos.to_i32() as u32);
        for s in [&config.function, &config.lib, &config.class] {
            if !s.is_empty() {
                frame.extend_from_slice(s.as_bytes());
                frame.push(0);
            }
        }
        frame.extend_from_slice(name.as_bytes());
        frame.push(0);

        let mut stream = self.lock().await?;
        codec::write_all(&mut *stream, &frame).await?;
        let reply = codec::read_words(&mut *stream, 2).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok(reply[1] as StatId),
            Some(EtError::Exists(_)) => Err(EtError::Exists(reply[1] as StatId)),
            Some(e) => Err(e),
        }
    }

    pub async fn station_create(&self, name: &str, config: &StationConfig) -> Result<StatId> {
        self.station_create_at(name, config, Position::End, ParallelPos::End).await
    }

    pub async fn station_remove(&self, stat: StatId) -> Result<()> {
        self.rpc_status(&[STAT_RM, stat as u32]).await
    }

    pub async fn attach(&self, stat: StatId) -> Result<AttId> {
        let host = iface::uname();
        let iface_addr = self
            .local_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_default();

        let mut frame = Vec::with_capacity(64);
        codec::put_word(&mut frame, STAT_ATT);
        codec::put_word(&mut frame, stat as u32);
        codec::put_word(&mut frame, std::process::id());
        codec::put_word(&mut frame, host.len() as u32 + 1);
        codec::put_word(
            &mut frame,
            if iface_addr.is_empty() { 0 } else { iface_addr.len() as u32 + 1 },
        );
        frame.extend_from_slice(host.as_bytes());
        frame.push(0);
        if !iface_addr.is_empty() {
            frame.extend_from_slice(iface_addr.as_bytes());
            frame.push(0);
        }

        let mut stream = self.lock().await?;
        codec::write_all(&mut *stream, &frame).await?;
        let reply = codec::read_words(&mut *stream, 2).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok(reply[1] as AttId),
            Some(e) => Err(e),
        }
    }

    pub async fn detach(&self, att: AttId) -> Result<()> {
        self.rpc_status(&[STAT_DET, att as u32]).await
    }

    pub async fn station_position(&self, stat: StatId) -> Result<(usize, usize)> {
        let reply = self.rpc(&[STAT_GPOS, stat as u32], 3).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok((reply[1] as usize, reply[2] as usize)),
            Some(e) => Err(e),
        }
    }

    pub async fn station_set_position(
        &self,
        stat: StatId,
        position: Position,
        ppos: ParallelPos,
    ) -> Result<()> {
        self.rpc_status(&[
            STAT_SPOS,
            stat as u32,
            position.to_i32() as u32,
            ppos.to_i32() as u32,
        ])
        .await
    }

    pub async fn station_is_attached(&self, stat: StatId, att: AttId) -> Result<bool> {
        let reply = self.rpc(&[STAT_ISAT, stat as u32, att as u32], 1).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok(reply[0] == 1),
            Some(e) => Err(e),
        }
    }

    pub async fn station_exists(&self, name: &str) -> Result<Option<StatId>> {
        let mut frame = Vec::with_capacity(16 + name.len());
        codec::put_word(&mut frame, STAT_EX);
        codec::put_cstr(&mut frame, name);
        let mut stream = self.lock().await?;
        codec::write_all(&mut *stream, &frame).await?;
        let reply = codec::read_words(&mut *stream, 2).await?;
        match reply[0] as i32 {
            1 => Ok(Some(reply[1] as StatId)),
            0 => Ok(None),
            code => Err(EtError::from_code(code).unwrap_or(EtError::Error)),
        }
    }

    pub async fn station_set_select_words(&self, stat: StatId, select: &[i32; NSELECTS]) -> Result<()> {
        let mut request = vec![STAT_SSW, stat as u32];
        request.extend(select.iter().map(|&s| s as u32));
        self.rpc_status(&request).await
    }

    pub async fn station_select_words(&self, stat: StatId) -> Result<[i32; NSELECTS]> {
        let reply = self.rpc(&[STAT_GSW, stat as u32], 1 + NSELECTS).await?;
        if let Some(e) = EtError::from_code(reply[0] as i32) {
            return Err(e);
        }
        let mut select = [0i32; NSELECTS];
        for i in 0..NSELECTS {
            select[i] = reply[1 + i] as i32;
        }
        Ok(select)
    }

    async fn station_string(&self, cmd: u32, stat: StatId) -> Result<String> {
        let mut stream = self.lock().await?;
        codec::write_words(&mut *stream, &[cmd, stat as u32]).await?;
        let head = codec::read_words(&mut *stream, 2).await?;
        if let Some(e) = EtError::from_code(head[0] as i32) {
            return Err(e);
        }
        let len = head[1] as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let mut bytes = codec::read_bytes(&mut *stream, len).await?;
        if bytes.pop() != Some(0) {
            return Err(EtError::Read);
        }
        String::from_utf8(bytes).map_err(|_| EtError::Read)
    }

    pub async fn station_lib(&self, stat: StatId) -> Result<String> {
        self.station_string(STAT_LIB, stat).await
    }

    pub async fn station_function(&self, stat: StatId) -> Result<String> {
        self.station_string(STAT_FUNC, stat).await
    }

    pub async fn station_class(&self, stat: StatId) -> Result<String> {
        self.station_string(STAT_CLASS, stat).await
    }

    async fn station_int(&self, cmd: u32, stat: StatId) -> Result<u32> {
        let reply = self.rpc(&[cmd, stat as u32], 2).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok(reply[1]),
            Some(e) => Err(e),
        }
    }

    async fn station_set_int(&self, cmd: u32, stat: StatId, value: i32) -> Result<()> {
        self.rpc_status(&[cmd, stat as u32, value as u32]).await
    }

    pub async fn station_attachments(&self, stat: StatId) -> Result<usize> {
        Ok(self.station_int(STAT_GATTS, stat).await? as usize)
    }

    pub async fn station_status(&self, stat: StatId) -> Result<StationState> {
        StationState::from_i32(self.station_int(STAT_STATUS, stat).await? as i32)
    }

    pub async fn station_input_count(&self, stat: StatId) -> Result<usize> {
        Ok(self.station_int(STAT_INCNT, stat).await? as usize)
    }

    pub async fn station_output_count(&self, stat: StatId) -> Result<usize> {
        Ok(self.station_int(STAT_OUTCNT, stat).await? as usize)
    }

    pub async fn station_block_mode(&self, stat: StatId) -> Result<BlockMode> {
        BlockMode::from_i32(self.station_int(STAT_GBLOCK, stat).await? as i32)
    }

    pub async fn station_user_mode(&self, stat: StatId) -> Result<UserMode> {
        UserMode::from_i32(self.station_int(STAT_GUSER, stat).await? as i32)
    }

    pub async fn station_restore_mode(&self, stat: StatId) -> Result<RestoreMode> {
        RestoreMode::from_i32(self.station_int(STAT_GRESTORE, stat).await? as i32)
    }

    pub async fn station_prescale(&self, stat: StatId) -> Result<u32> {
        self.station_int(STAT_GPRE, stat).await
    }

    pub async fn station_cue(&self, stat: StatId) -> Result<usize> {
        Ok(self.station_int(STAT_GCUE, stat).await? as usize)
    }

    pub async fn station_select_mode(&self, stat: StatId) -> Result<SelectMode> {
        SelectMode::from_i32(self.station_int(STAT_GSELECT, stat).await? as i32)
    }

    pub async fn station_set_block_mode(&self, stat: StatId, mode: BlockMode) -> Result<()> {
        self.station_set_int(STAT_SBLOCK, stat, mode.to_i32()).await
    }

    pub async fn station_set_user_mode(&self, stat: StatId, mode: UserMode) -> Result<()> {
        self.station_set_int(STAT_SUSER, stat, mode.to_i32()).await
    }

    pub async fn station_set_restore_mode(&self, stat: StatId, mode: RestoreMode) -> Result<()> {
        self.station_set_int(STAT_SRESTORE, stat, mode.to_i32()).await
    }

    pub async fn station_set_prescale(&self, stat: StatId, prescale: u32) -> Result<()> {
        self.station_set_int(STAT_SPRE, stat, prescale as i32).await
    }

    pub async fn station_set_cue(&self, stat: StatId, cue: usize) -> Result<()> {
        self.station_set_int(STAT_SCUE, stat, cue as i32).await
    }

    // =========================================================================
    // ATTACHMENT COUNTERS AND SYSTEM QUERIES
    // =========================================================================

    async fn attachment_counter(&self, cmd: u32, att: AttId) -> Result<u64> {
        let reply = self.rpc(&[cmd, att as u32], 3).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok(join(reply[1], reply[2])),
            Some(e) => Err(e),
        }
    }

    pub async fn attachment_events_put(&self, att: AttId) -> Result<u64> {
        self.attachment_counter(ATT_PUT, att).await
    }

    pub async fn attachment_events_get(&self, att: AttId) -> Result<u64> {
        self.attachment_counter(ATT_GET, att).await
    }

    pub async fn attachment_events_dump(&self, att: AttId) -> Result<u64> {
        self.attachment_counter(ATT_DUMP, att).await
    }

    pub async fn attachment_events_make(&self, att: AttId) -> Result<u64> {
        self.attachment_counter(ATT_MAKE, att).await
    }

    async fn system_int(&self, cmd: u32) -> Result<u32> {
        let reply = self.rpc(&[cmd], 2).await?;
        match EtError::from_code(reply[0] as i32) {
            None => Ok(reply[1]),
            Some(e) => Err(e),
        }
    }

    pub async fn system_temps(&self) -> Result<usize> {
        Ok(self.system_int(SYS_TMP).await? as usize)
    }

    pub async fn system_temps_max(&self) -> Result<usize> {
        Ok(self.system_int(SYS_TMPMAX).await? as usize)
    }

    pub async fn system_stations(&self) -> Result<usize> {
        Ok(self.system_int(SYS_STAT).await? as usize)
    }

    pub async fn system_stations_max(&self) -> Result<usize> {
        Ok(self.system_int(SYS_STATMAX).await? as usize)
    }

    pub async fn system_attachments(&self) -> Result<usize> {
        Ok(self.system_int(SYS_ATT).await? as usize)
    }

    pub async fn system_attachments_max(&self) -> Result<usize> {
        Ok(self.system_int(SYS_ATTMAX).await? as usize)
    }

    pub async fn system_heartbeat(&self) -> Result<u64> {
        Ok(self.system_int(SYS_HBEAT).await? as u64)
    }

    pub async fn system_pid(&self) -> Result<u32> {
        self.system_int(SYS_PID).await
    }

    pub async fn system_group_count(&self) -> Result<usize> {
        Ok(self.system_int(SYS_GRP).await? as usize)
    }

    pub async fn system_group_quotas(&self) -> Result<Vec<usize>> {
        let mut stream = self.lock().await?;
        codec::write_words(&mut *stream, &[SYS_GRPS]).await?;
        let count = codec::read_word(&mut *stream).await? as usize;
        let quotas = codec::read_words(&mut *stream, count).await?;
        Ok(quotas.into_iter().map(|q| q as usize).collect())
    }

    // =========================================================================
    // EVENT TRANSFER
    // =========================================================================

    /// Split a wait into (rounds, per-round delta). `Sleep` polls
    /// forever; a `Timed` wait over a second is cut into 200 ms rounds
    /// so other session commands can interleave.
    fn wait_plan(mode: Mode) -> (Option<u64>, Duration) {
        match mode {
            Mode::Sleep => (None, ROUND_WAIT),
            Mode::Timed(d) if d > Duration::from_secs(1) => {
                let rounds = d.as_micros().div_ceil(ROUND_WAIT.as_micros()) as u64;
                (Some(rounds), ROUND_WAIT)
            }
            Mode::Timed(d) => (Some(1), d),
            Mode::Async => (Some(1), Duration::ZERO),
        }
    }

    /// Get events from the attachment's station.
    pub async fn get_events(
        &self,
        att: AttId,
        mode: Mode,
        modify: Modify,
        num: usize,
    ) -> Result<Vec<RemoteEvent>> {
        self.transfer_in(att, mode, modify, false, num).await
    }

    pub async fn get_event(&self, att: AttId, mode: Mode, modify: Modify) -> Result<RemoteEvent> {
        let mut events = self.transfer_in(att, mode, modify, false, 1).await?;
        events.pop().ok_or(EtError::Error)
    }

    async fn transfer_in(
        &self,
        att: AttId,
        mode: Mode,
        modify: Modify,
        dump: bool,
        num: usize,
    ) -> Result<Vec<RemoteEvent>> {
        let (mut rounds, delta) = Self::wait_plan(mode);
        let bits = modify_to_bits(modify) | if dump { MODE_DUMP } else { 0 };
        let batch = num > 1;

        let wait = if mode == Mode::Async { WAIT_ASYNC } else { WAIT_TIMED };
        let mut request: Vec<u32> = Vec::with_capacity(7);
        request.push(if batch { EVS_GET } else { EV_GET });
        request.push(att as u32);
        request.push(wait as u32);
        request.push(bits as u32);
        if batch {
            request.push(num as u32);
        }
        request.push(delta.as_secs() as u32);
        request.push(delta.subsec_nanos());

        let mut pause = false;
        loop {
            if pause {
                tokio::time::sleep(ROUND_GAP).await;
            }
            pause = true;

            let mut stream = self.lock().await?;
            codec::write_words(&mut *stream, &request).await?;
            let first = codec::read_word(&mut *stream).await? as i32;

            if let Some(e) = EtError::from_code(first) {
                drop(stream);
                if e == EtError::Timeout {
                    match &mut rounds {
                        None => continue,
                        Some(r) if *r > 1 => {
                            *r -= 1;
                            continue;
                        }
                        _ => return Err(if mode == Mode::Async { EtError::Empty } else { e }),
                    }
                }
                return Err(e);
            }

            // Success: `first` is the event count for a batch, OK for a
            // single get where exactly one event follows.
            let count = if batch {
                let _total = codec::read_words(&mut *stream, 2).await?;
                first as usize
            } else {
                1
            };

            let mut events = Vec::with_capacity(count);
            for _ in 0..count {
                events.push(Self::read_event(&mut stream, modify).await?);
            }
            return Ok(events);
        }
    }

    async fn read_event(
        stream: &mut MutexGuard<'_, TcpStream>,
        modify: Modify,
    ) -> Result<RemoteEvent> {
        let head = codec::read_words(&mut **stream, EVENT_HEADER_WORDS).await?;
        let length = join(head[0], head[1]);
        let memsize = join(head[2], head[3]);
        let pristat = head[4] as i32;
        let mut control = [0i32; NSELECTS];
        for i in 0..NSELECTS {
            control[i] = head[9 + i] as i32;
        }
        let data = codec::read_bytes(&mut **stream, length as usize).await?;
        Ok(RemoteEvent {
            place: head[5] as Place,
            length,
            memsize,
            priority: Priority::from_i32(pristat & PRIORITY_MASK),
            datastatus: DataStatus::from_i32((pristat & DATA_MASK) >> DATA_SHIFT),
            byteorder: head[7],
            control,
            modify,
            data,
        })
    }

    /// Allocate fresh events. The broker hands them out checked out for
    /// full modification; payload travels on the eventual put.
    pub async fn new_events(
        &self,
        att: AttId,
        mode: Mode,
        size: u64,
        num: usize,
        group: Option<usize>,
        no_alloc: bool,
    ) -> Result<Vec<RemoteEvent>> {
        let (mut rounds, delta) = Self::wait_plan(mode);
        let wait = if mode == Mode::Async { WAIT_ASYNC } else { WAIT_TIMED };
        let mode_bits = wait as u32 | if no_alloc { MODE_NOALLOC as u32 } else { 0 };
        let batch = num > 1 || group.is_some();

        let mut request: Vec<u32> = Vec::with_capacity(8);
        request.push(match group {
            Some(_) => EVS_NEW_GRP,
            None if batch => EVS_NEW,
            None => EV_NEW,
        });
        request.push(att as u32);
        request.push(mode_bits);
        request.push(hi(size));
        request.push(lo(size));
        if batch {
            request.push(num as u32);
        }
        if let Some(g) = group {
            // 1-based on the wire.
            request.push(g as u32 + 1);
        }
        request.push(delta.as_secs() as u32);
        request.push(delta.subsec_nanos());

        let mut pause = false;
        loop {
            if pause {
                tokio::time::sleep(ROUND_GAP).await;
            }
            pause = true;

            let mut stream = self.lock().await?;
            codec::write_words(&mut *stream, &request).await?;
            let first = codec::read_word(&mut *stream).await? as i32;

            if let Some(e) = EtError::from_code(first) {
                if !batch {
                    // Single-new replies are fixed at three words.
                    let _rest = codec::read_words(&mut *stream, 2).await?;
                }
                drop(stream);
                if e == EtError::Timeout {
                    match &mut rounds {
                        None => continue,
                        Some(r) if *r > 1 => {
                            *r -= 1;
                            continue;
                        }
                        _ => return Err(if mode == Mode::Async { EtError::Empty } else { e }),
                    }
                }
                return Err(e);
            }

            let places: Vec<Place> = if batch {
                let words = codec::read_words(&mut *stream, first as usize).await?;
                words.into_iter().map(|w| w as Place).collect()
            } else {
                let rest = codec::read_words(&mut *stream, 2).await?;
                vec![rest[0] as Place]
            };

            return Ok(places
                .into_iter()
                .map(|place| RemoteEvent {
                    place,
                    length: 0,
                    memsize: size.max(self.event_size),
                    priority: Priority::Low,
                    datastatus: DataStatus::Ok,
                    byteorder: 0,
                    control: [0; NSELECTS],
                    modify: Modify::Full,
                    data: Vec::with_capacity(size as usize),
                })
                .collect());
        }
    }

    pub async fn new_event(&self, att: AttId, mode: Mode, size: u64) -> Result<RemoteEvent> {
        let mut events = self.new_events(att, mode, size, 1, None, false).await?;
        events.pop().ok_or(EtError::Error)
    }

    fn put_header(frame: &mut Vec<u8>, ev: &RemoteEvent) {
        codec::put_word(frame, ev.place as u32);
        codec::put_word(frame, 0);
        codec::put_word(frame, hi(ev.length));
        codec::put_word(frame, lo(ev.length));
        codec::put_word(
            frame,
            (ev.priority.to_i32() | (ev.datastatus.to_i32() << DATA_SHIFT)) as u32,
        );
        codec::put_word(frame, ev.byteorder);
        codec::put_word(frame, 0);
        for i in 0..NSELECTS {
            codec::put_word(frame, ev.control[i] as u32);
        }
    }

    /// Put events back into the pipeline. Payload travels only for
    /// events checked out with `Modify::Full`.
    pub async fn put_events(&self, att: AttId, events: &[RemoteEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for ev in events {
            if ev.length > ev.memsize || (ev.modify == Modify::Full && (ev.data.len() as u64) < ev.length)
            {
                return Err(EtError::BadArg);
            }
        }

        let batch = events.len() > 1;
        let mut frame = Vec::with_capacity(64 * events.len());
        if batch {
            let total: u64 = events
                .iter()
                .map(|e| (PUT_HEADER_WORDS * 4) as u64 + e.length)
                .sum();
            codec::put_word(&mut frame, EVS_PUT);
            codec::put_word(&mut frame, att as u32);
            codec::put_word(&mut frame, events.len() as u32);
            codec::put_word(&mut frame, hi(total));
            codec::put_word(&mut frame, lo(total));
        } else {
            codec::put_word(&mut frame, EV_PUT);
            codec::put_word(&mut frame, att as u32);
        }
        for ev in events {
            Self::put_header(&mut frame, ev);
            if ev.modify == Modify::Full {
                frame.extend_from_slice(&ev.data[..ev.length as usize]);
            }
        }

        let mut stream = self.lock().await?;
        codec::write_all(&mut *stream, &frame).await?;
        let reply = codec::read_word(&mut *stream).await? as i32;
        match EtError::from_code(reply) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn put_event(&self, att: AttId, event: &RemoteEvent) -> Result<()> {
        self.put_events(att, std::slice::from_ref(event)).await
    }

    /// Discard events straight to grand central.
    pub async fn dump_events(&self, att: AttId, events: &[RemoteEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = events.len() > 1;
        let mut request: Vec<u32> = Vec::with_capacity(3 + events.len());
        if batch {
            request.push(EVS_DUMP);
            request.push(att as u32);
            request.push(events.len() as u32);
            request.extend(events.iter().map(|e| e.place as u32));
        } else {
            request.push(EV_DUMP);
            request.push(att as u32);
            request.push(events[0].place as u32);
        }
        self.rpc_status(&request).await
    }

    pub async fn dump_event(&self, att: AttId, event: &RemoteEvent) -> Result<()> {
        self.dump_events(att, std::slice::from_ref(event)).await
    }
}
