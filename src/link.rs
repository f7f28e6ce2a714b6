//! Datagram-level access to the wire.
//!
//! Clients append datagrams, not frames: the link batches them into Ethernet
//! frames, allocates the rotating 8-bit index, and correlates every answer
//! back to the callbacks registered for that index. With a live redundancy
//! interface the link also carries the cable-failover policy.

use core::time::Duration;

use log::{debug, warn};

use crate::error::{DatagramState, EcatError};
use crate::frame::*;
use crate::port::RawPort;

const INDEX_SPACE: usize = 256;

/// Reply callback: `(context, argument, header, payload, wkc)`.
///
/// Callbacks are plain function pointers plus a caller-chosen `u32`
/// argument (a slave position, a process-image frame index...). This keeps
/// the 256-slot table allocation free; whatever state a callback needs
/// lives in the context passed to [`Link::process_datagrams`].
pub type OnReply<Ctx> = fn(
    ctx: &mut Ctx,
    arg: u32,
    header: &DatagramHeader<[u8; DATAGRAM_HEADER_SIZE]>,
    data: &[u8],
    wkc: u16,
) -> DatagramState;

/// Error callback, fired exactly once for every datagram that did not end
/// the tick in [`DatagramState::Ok`].
pub type OnError<Ctx> = fn(ctx: &mut Ctx, arg: u32, state: DatagramState) -> Result<(), EcatError>;

pub fn ignore_error<Ctx>(_: &mut Ctx, _: u32, _: DatagramState) -> Result<(), EcatError> {
    Ok(())
}

pub fn fail_on_error<Ctx>(_: &mut Ctx, _: u32, state: DatagramState) -> Result<(), EcatError> {
    Err(EcatError::Datagram(state))
}

fn unarmed_reply<Ctx>(
    _: &mut Ctx,
    _: u32,
    _: &DatagramHeader<[u8; DATAGRAM_HEADER_SIZE]>,
    _: &[u8],
    _: u16,
) -> DatagramState {
    DatagramState::NoHandler
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotMode {
    /// Waiting for the answer of a datagram issued this tick.
    Armed,
    /// Stale index: a matching answer is a late frame to pop and drop.
    Drain,
}

struct Slot<Ctx> {
    status: DatagramState,
    mode: SlotMode,
    on_reply: OnReply<Ctx>,
    on_error: OnError<Ctx>,
    arg: u32,
}

impl<Ctx> Clone for Slot<Ctx> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Ctx> Copy for Slot<Ctx> {}

impl<Ctx> Slot<Ctx> {
    fn empty() -> Self {
        Self {
            status: DatagramState::Lost,
            mode: SlotMode::Drain,
            on_reply: unarmed_reply::<Ctx>,
            on_error: ignore_error::<Ctx>,
            arg: 0,
        }
    }
}

pub struct Link<N, R, Ctx>
where
    N: RawPort,
    R: RawPort,
{
    nominal: N,
    redundancy: R,
    frame: Frame,
    /// Oldest outstanding index.
    index_queue: u8,
    /// Next index to allocate.
    index_head: u8,
    sent_frames: u8,
    callbacks: [Slot<Ctx>; INDEX_SPACE],
    redundancy_active: bool,
    lost_frames: usize,
}

impl<N, R, Ctx> Link<N, R, Ctx>
where
    N: RawPort,
    R: RawPort,
{
    /// Build the link and probe the line once.
    ///
    /// The probe writes one BRD on the redundancy port. A frame coming back
    /// on either port means a second interface is live and replies will be
    /// read from it; a non-zero working counter on that frame means slaves
    /// processed the probe on its way back, i.e. the ring is broken, and
    /// `report_redundancy` fires once.
    pub fn new(
        nominal: N,
        redundancy: R,
        report_redundancy: fn(),
    ) -> Result<Self, EcatError> {
        let mut link = Self {
            nominal,
            redundancy,
            frame: Frame::new(),
            index_queue: 0,
            index_head: 0,
            sent_frames: 0,
            callbacks: [Slot::empty(); INDEX_SPACE],
            redundancy_active: false,
            lost_frames: 0,
        };

        let wkc = link.probe_redundancy()?;
        if let Some(wkc) = wkc {
            link.redundancy_active = true;
            debug!("redundancy interface is live (probe wkc {})", wkc);
            if wkc != 0 {
                warn!("broken ring detected, redundancy in use");
                report_redundancy();
            }
        }
        Ok(link)
    }

    /// `Some(wkc)` when a second interface answered, `None` otherwise.
    fn probe_redundancy(&mut self) -> Result<Option<u16>, EcatError> {
        let mut frame = Frame::new();
        frame.add_datagram(0, Command::new_read(TargetSlave::All(0), 0x0000), &[], 1)?;
        frame.write_to(&mut self.redundancy, SECONDARY_MAC)?;

        let got_one = match frame.read_from(&mut self.nominal) {
            Ok(size) if size > 0 => true,
            _ => matches!(frame.read_from(&mut self.redundancy), Ok(size) if size > 0),
        };
        if !got_one {
            return Ok(None);
        }
        match frame.next_datagram() {
            Some((_, _, wkc)) => Ok(Some(wkc)),
            None => Ok(None),
        }
    }

    pub fn is_redundancy_active(&self) -> bool {
        self.redundancy_active
    }

    /// Datagrams whose answer never showed up, since construction.
    pub fn lost_frame_count(&self) -> usize {
        self.lost_frames
    }

    /// Queue one datagram and bind its completion callbacks.
    ///
    /// The frame is flushed on the spot when it cannot host the datagram or
    /// becomes full. At most 255 datagrams may be outstanding.
    pub fn add_datagram(
        &mut self,
        command: Command,
        data: &[u8],
        size: u16,
        on_reply: OnReply<Ctx>,
        on_error: OnError<Ctx>,
        arg: u32,
    ) -> Result<(), EcatError> {
        if self.index_queue == self.index_head.wrapping_add(1) {
            return Err(EcatError::TooManyInFlight);
        }

        if self.frame.free_space() < datagram_size(size as usize) {
            self.send_frame();
        }

        self.frame.add_datagram(self.index_head, command, data, size)?;
        self.callbacks[self.index_head as usize] = Slot {
            status: DatagramState::Lost,
            mode: SlotMode::Armed,
            on_reply,
            on_error,
            arg,
        };
        self.index_head = self.index_head.wrapping_add(1);

        if self.frame.is_full() {
            self.send_frame();
        }
        Ok(())
    }

    /// Flush the pending frame, if any datagram is waiting in it.
    pub fn finalize_datagrams(&mut self) {
        if self.frame.datagram_counter() != 0 {
            self.send_frame();
        }
    }

    fn send_frame(&mut self) {
        let datagrams = self.frame.datagram_counter();
        match self.frame.write_to(&mut self.nominal, PRIMARY_MAC) {
            Ok(()) => self.sent_frames += 1,
            Err(err) => {
                warn!("frame send failed: {:?}", err);
                for i in 0..datagrams {
                    let index = self.index_head.wrapping_sub(i as u8 + 1);
                    self.callbacks[index as usize].status = DatagramState::SendError;
                }
            }
        }
    }

    fn read_reply(&mut self) -> Result<usize, EcatError> {
        if self.redundancy_active {
            self.frame.read_from(&mut self.redundancy)
        } else {
            self.frame.read_from(&mut self.nominal)
        }
    }

    /// A late frame from a previous tick was popped; discard it and pull
    /// one more frame off the nominal port so this tick's answer is not
    /// lost behind it.
    fn drain_late_frame(&mut self) -> Result<usize, EcatError> {
        warn!("late frame drained");
        self.frame.read_from(&mut self.nominal)
    }

    /// Flush, collect every answer, then run the error callbacks.
    ///
    /// Each datagram issued since the last call sees exactly one outcome:
    /// its `on_reply` when an answer arrived, and its `on_error` when the
    /// final status is not `Ok` (lost, send error, bad working counter).
    /// The last error returned by an `on_error` is propagated after all
    /// callbacks ran, so one bad datagram cannot starve the others.
    pub fn process_datagrams(&mut self, ctx: &mut Ctx) -> Result<(), EcatError> {
        self.finalize_datagrams();

        let waiting_frames = self.sent_frames;
        self.sent_frames = 0;

        for _ in 0..waiting_frames {
            match self.read_reply() {
                Ok(size) if size > 0 => {}
                Ok(_) | Err(_) => continue,
            }

            // Late frames from a previous tick map onto drained slots.
            let mut guard = 0;
            while let Some(index) = self.frame.peek_index() {
                if self.callbacks[index as usize].mode == SlotMode::Armed {
                    break;
                }
                guard += 1;
                if guard > 4 || !matches!(self.drain_late_frame(), Ok(size) if size > 0) {
                    break;
                }
            }

            while let Some((header, data, wkc)) = self.frame.next_datagram() {
                let slot = self.callbacks[header.index() as usize];
                if slot.mode == SlotMode::Armed {
                    let status = (slot.on_reply)(ctx, slot.arg, &header, data, wkc);
                    self.callbacks[header.index() as usize].status = status;
                }
            }
        }

        let mut client_error = None;
        let mut index = self.index_queue;
        while index != self.index_head {
            let slot = self.callbacks[index as usize];
            if slot.status != DatagramState::Ok {
                if slot.status == DatagramState::Lost {
                    self.lost_frames += 1;
                }
                if let Err(err) = (slot.on_error)(ctx, slot.arg, slot.status) {
                    client_error = Some(err);
                }
            }
            self.callbacks[index as usize].mode = SlotMode::Drain;
            index = index.wrapping_add(1);
        }
        self.index_queue = self.index_head;

        match client_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Trivial init-path primitive: one frame out, one frame back.
    pub fn write_then_read(&mut self, frame: &mut Frame) -> Result<(), EcatError> {
        frame.write_to(&mut self.nominal, PRIMARY_MAC)?;
        let size = if self.redundancy_active {
            frame.read_from(&mut self.redundancy)?
        } else {
            frame.read_from(&mut self.nominal)?
        };
        if size == 0 {
            return Err(EcatError::Phy(crate::error::PhyError::Timeout));
        }
        Ok(())
    }

    pub fn set_timeouts(&mut self, timeout: Option<Duration>) {
        self.nominal.set_timeout(timeout);
        self.redundancy.set_timeout(timeout);
    }
}

/// Shorthand for the owned header handed to reply callbacks.
pub type ReplyHeader = DatagramHeader<[u8; DATAGRAM_HEADER_SIZE]>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PhyError;
    use crate::port::NullPort;
    use std::vec::Vec as StdVec;

    /// Port that records written frames and answers them from a script.
    /// `echo` mode loops every written frame back with the given wkc.
    struct SimPort {
        tx: StdVec<StdVec<u8>>,
        rx: StdVec<StdVec<u8>>,
        echo_wkc: Option<u16>,
        fail_writes: bool,
    }

    impl SimPort {
        fn new() -> Self {
            Self { tx: vec![], rx: vec![], echo_wkc: None, fail_writes: false }
        }

        fn echo(wkc: u16) -> Self {
            Self { echo_wkc: Some(wkc), ..Self::new() }
        }

        fn answer_all(frame: &[u8], wkc: u16) -> StdVec<u8> {
            let mut reply = frame.to_vec();
            let mut parsed = Frame::from_bytes(frame);
            let mut offset = ETHERNET_HEADER_SIZE + ETHERCAT_HEADER_SIZE;
            while let Some((header, data, _)) = parsed.next_datagram() {
                let wkc_at = offset + DATAGRAM_HEADER_SIZE + data.len();
                reply[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());
                offset = wkc_at + 2;
                if !header.more_follows() {
                    break;
                }
            }
            reply
        }
    }

    impl RawPort for SimPort {
        fn open(&mut self, _interface: &str) -> Result<(), PhyError> {
            Ok(())
        }
        fn set_timeout(&mut self, _timeout: Option<core::time::Duration>) {}
        fn close(&mut self) {}
        fn write(&mut self, frame: &[u8]) -> Result<usize, PhyError> {
            if self.fail_writes {
                return Err(PhyError::Io(5));
            }
            if let Some(wkc) = self.echo_wkc {
                let reply = Self::answer_all(frame, wkc);
                self.rx.push(reply);
            }
            self.tx.push(frame.to_vec());
            Ok(frame.len())
        }
        fn read(&mut self, frame: &mut [u8]) -> Result<usize, PhyError> {
            if self.rx.is_empty() {
                return Err(PhyError::Timeout);
            }
            let next = self.rx.remove(0);
            frame[..next.len()].copy_from_slice(&next);
            Ok(next.len())
        }
    }

    #[derive(Default)]
    struct Counters {
        replies: usize,
        errors: usize,
        last_state: Option<DatagramState>,
    }

    fn count_reply(
        ctx: &mut Counters,
        _arg: u32,
        _header: &ReplyHeader,
        _data: &[u8],
        _wkc: u16,
    ) -> DatagramState {
        ctx.replies += 1;
        DatagramState::Ok
    }

    fn count_error(ctx: &mut Counters, _arg: u32, state: DatagramState) -> Result<(), EcatError> {
        ctx.errors += 1;
        ctx.last_state = Some(state);
        Ok(())
    }

    fn noop_hook() {}

    fn single_link(nominal: SimPort) -> Link<SimPort, NullPort, Counters> {
        Link::new(nominal, NullPort, noop_hook).unwrap()
    }

    #[test]
    fn every_datagram_sees_exactly_one_outcome() {
        let mut link = single_link(SimPort::echo(1));
        let mut ctx = Counters::default();

        for i in 0..5 {
            link.add_datagram(
                Command::new_read(TargetSlave::All(1), 0x0000),
                &[],
                1,
                count_reply,
                count_error,
                i,
            )
            .unwrap();
        }
        link.process_datagrams(&mut ctx).unwrap();

        assert_eq!(5, ctx.replies);
        assert_eq!(0, ctx.errors);
    }

    #[test]
    fn lost_datagrams_fire_on_error_once() {
        // No echo: writes succeed, nothing ever comes back.
        let mut link = single_link(SimPort::new());
        let mut ctx = Counters::default();

        for _ in 0..3 {
            link.add_datagram(
                Command::new_read(TargetSlave::All(1), 0x0000),
                &[],
                1,
                count_reply,
                count_error,
                0,
            )
            .unwrap();
        }
        link.process_datagrams(&mut ctx).unwrap();

        assert_eq!(0, ctx.replies);
        assert_eq!(3, ctx.errors);
        assert_eq!(Some(DatagramState::Lost), ctx.last_state);
        assert_eq!(3, link.lost_frame_count());

        // Next tick: nothing outstanding, no duplicate error callbacks.
        link.process_datagrams(&mut ctx).unwrap();
        assert_eq!(3, ctx.errors);
    }

    #[test]
    fn send_error_marks_whole_frame() {
        let mut nominal = SimPort::new();
        nominal.fail_writes = true;
        let mut link = single_link(nominal);
        let mut ctx = Counters::default();

        link.add_datagram(
            Command::new_read(TargetSlave::All(1), 0x0000),
            &[],
            1,
            count_reply,
            count_error,
            0,
        )
        .unwrap();
        link.process_datagrams(&mut ctx).unwrap();

        assert_eq!(1, ctx.errors);
        assert_eq!(Some(DatagramState::SendError), ctx.last_state);
    }

    #[test]
    fn last_error_callback_failure_is_reported_after_draining() {
        fn failing_error(
            ctx: &mut Counters,
            _arg: u32,
            state: DatagramState,
        ) -> Result<(), EcatError> {
            ctx.errors += 1;
            Err(EcatError::Datagram(state))
        }

        let mut link = single_link(SimPort::new());
        let mut ctx = Counters::default();
        for _ in 0..2 {
            link.add_datagram(
                Command::new_read(TargetSlave::All(1), 0x0000),
                &[],
                1,
                count_reply,
                failing_error,
                0,
            )
            .unwrap();
        }

        let result = link.process_datagrams(&mut ctx);
        assert_eq!(Err(EcatError::Datagram(DatagramState::Lost)), result);
        // Both callbacks ran before the error surfaced.
        assert_eq!(2, ctx.errors);
    }

    #[test]
    fn too_many_in_flight_is_rejected() {
        let mut link = single_link(SimPort::echo(0));
        for _ in 0..255 {
            link.add_datagram(
                Command::new_read(TargetSlave::All(0), 0x0000),
                &[],
                1,
                count_reply,
                count_error,
                0,
            )
            .unwrap();
        }
        let overflow = link.add_datagram(
            Command::new_read(TargetSlave::All(0), 0x0000),
            &[],
            1,
            count_reply,
            count_error,
            0,
        );
        assert_eq!(Err(EcatError::TooManyInFlight), overflow);
    }

    #[test]
    fn big_datagrams_split_across_frames() {
        let mut link = single_link(SimPort::echo(1));
        let mut ctx = Counters::default();

        // Two 1000 byte payloads cannot share one frame.
        for _ in 0..2 {
            link.add_datagram(
                Command::new_read(TargetSlave::All(1), 0x0000),
                &[],
                1000,
                count_reply,
                count_error,
                0,
            )
            .unwrap();
        }
        link.process_datagrams(&mut ctx).unwrap();
        assert_eq!(2, ctx.replies);
    }

    #[test]
    fn intact_ring_probe_activates_redundancy_silently() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn hook() {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        // Intact ring: probe written on redundancy comes back unprocessed
        // (wkc 0) on the nominal side.
        let mut nominal = SimPort::new();
        let redundancy = SimPort::echo(0);
        // Build the probe reply: simulate by echoing through redundancy
        // then moving its echo to the nominal rx queue.
        let link: Link<SimPort, SimPort, Counters> = {
            let mut probe = Frame::new();
            probe
                .add_datagram(0, Command::new_read(TargetSlave::All(0), 0x0000), &[], 1)
                .unwrap();
            probe.finalize();
            nominal.rx.push(SimPort::answer_all(&probe.data()[..60], 0));
            Link::new(nominal, redundancy, hook).unwrap()
        };

        assert!(link.is_redundancy_active());
        assert_eq!(0, FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn broken_ring_fires_redundancy_hook_once() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn hook() {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        // Nominal times out; the redundancy port answers its own probe with
        // a non-zero wkc: slaves behind the cut processed it.
        let nominal = SimPort::new();
        let redundancy = SimPort::echo(1);

        let link: Link<SimPort, SimPort, Counters> =
            Link::new(nominal, redundancy, hook).unwrap();
        assert!(link.is_redundancy_active());
        assert_eq!(1, FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn single_interface_stays_on_nominal() {
        let link = single_link(SimPort::new());
        assert!(!link.is_redundancy_active());
    }
}
