//! SDP Response Receiver
//!
//! Each pooled connection being used by at least one session gets exactly one
//! reader. The reader owns the incoming half of the channel, parses response
//! PDUs and hands each one to the transaction it answers.
//!
//! Readers run in a fixed set of [`MAX_CONNECTIONS`] slots hosted by
//! [`SdpReceiver::run`] (driven through [`SdpStack::run`]). Attaching a
//! connection claims an idle slot and signals it to start; detaching the last
//! user signals it to stop. Stop is raced against every blocking read; a PDU
//! interrupted by stop stays in the connection's [`PduReader`] and the next
//! reader finishes it.
//!
//! [`PduReader`]: super::connection::PduReader

use super::{
    ErrorReason, SdpError, SdpPduId, TransactionId,
    connection::{Connection, InboundPdu},
    stack::SdpStack,
    transaction::{Dispatch, TransactionKey},
};
use crate::{
    BluetoothAddress,
    constants::MAX_CONNECTIONS,
    l2cap::{L2capChannel, L2capConnector},
};
use alloc::sync::Arc;
use core::cell::RefCell;
use embassy_futures::{
    join::join_array,
    select::{Either, select},
};
use embassy_sync::{
    blocking_mutex::{Mutex, raw::CriticalSectionRawMutex},
    signal::Signal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Phase {
    Idle,
    Running,
    Stopping,
}

struct Slot<C: L2capChannel> {
    phase: Phase,
    connection: Option<Arc<Connection<C>>>,
    users: usize,
}

impl<C: L2capChannel> Slot<C> {
    const fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            connection: None,
            users: 0,
        }
    }

    fn serves(&self, connection: &Arc<Connection<C>>) -> bool {
        self.phase == Phase::Running
            && self
                .connection
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, connection))
    }
}

struct SlotSignals {
    start: Signal<CriticalSectionRawMutex, ()>,
    stop: Signal<CriticalSectionRawMutex, ()>,
    stopped: Signal<CriticalSectionRawMutex, ()>,
}

impl SlotSignals {
    const fn new() -> Self {
        Self {
            start: Signal::new(),
            stop: Signal::new(),
            stopped: Signal::new(),
        }
    }
}

/// Reader slot table owned by the stack
pub(crate) struct Readers<C: L2capChannel> {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[Slot<C>; MAX_CONNECTIONS]>>,
    signals: [SlotSignals; MAX_CONNECTIONS],
}

impl<C: L2capChannel> Readers<C> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new(core::array::from_fn(|_| Slot::idle()))),
            signals: [const { SlotSignals::new() }; MAX_CONNECTIONS],
        }
    }

    /// Number of slots currently hosting a reader
    pub(crate) fn active(&self) -> usize {
        self.slots.lock(|slots| {
            slots
                .borrow()
                .iter()
                .filter(|slot| slot.phase != Phase::Idle)
                .count()
        })
    }

    fn set_phase(&self, index: usize, phase: Phase) {
        self.slots
            .lock(|slots| slots.borrow_mut()[index].phase = phase);
    }

    fn finish(&self, index: usize) {
        self.signals[index].stopped.signal(());
        self.slots
            .lock(|slots| slots.borrow_mut()[index] = Slot::idle());
    }
}

/// Response receiver of an [`SdpStack`]
pub struct SdpReceiver<'a, C: L2capConnector> {
    stack: &'a SdpStack<C>,
}

impl<'a, C: L2capConnector> SdpReceiver<'a, C> {
    pub(crate) const fn new(stack: &'a SdpStack<C>) -> Self {
        Self { stack }
    }

    /// Make sure a reader is running for `connection` and count one more
    /// user of it
    ///
    /// # Errors
    /// Returns [`SdpError::TooManyConnections`] if every slot is busy, or
    /// [`SdpError::SessionClosed`] if the connection has left the pool
    pub async fn attach(&self, connection: &Arc<Connection<C::Channel>>) -> Result<(), SdpError> {
        let readers = &self.stack.readers;
        let claimed = readers.slots.lock(|slots| -> Result<Option<usize>, SdpError> {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = slots.iter_mut().find(|slot| slot.serves(connection)) {
                slot.users += 1;
                return Ok(None);
            }
            let index = slots
                .iter()
                .position(|slot| slot.phase == Phase::Idle)
                .ok_or(SdpError::TooManyConnections)?;
            slots[index] = Slot {
                phase: Phase::Running,
                connection: Some(Arc::clone(connection)),
                users: 1,
            };
            readers.signals[index].stop.reset();
            readers.signals[index].stopped.reset();
            Ok(Some(index))
        })?;

        let Some(index) = claimed else {
            return Ok(());
        };
        if !self.stack.pool.retain(connection).await {
            readers.finish(index);
            return Err(SdpError::SessionClosed);
        }
        readers.signals[index].start.signal(());
        debug!(
            "[SDP] reader {} attached to {:?}",
            index,
            connection.address()
        );
        Ok(())
    }

    /// Count one user less; the last one stops the reader
    pub fn detach(&self, connection: &Arc<Connection<C::Channel>>) {
        let readers = &self.stack.readers;
        let stopping = readers.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let index = slots.iter().position(|slot| slot.serves(connection))?;
            let slot = &mut slots[index];
            slot.users = slot.users.saturating_sub(1);
            if slot.users > 0 {
                return None;
            }
            slot.phase = Phase::Stopping;
            Some(index)
        });
        if let Some(index) = stopping {
            debug!(
                "[SDP] stopping reader {} for {:?}",
                index,
                connection.address()
            );
            readers.signals[index].stop.signal(());
        }
    }

    /// Stop every reader, terminate every pending transaction and wait until
    /// all readers have exited
    pub async fn cancel_all(&self) {
        let readers = &self.stack.readers;
        let active: [bool; MAX_CONNECTIONS] = readers.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            core::array::from_fn(|index| {
                let slot = &mut slots[index];
                if slot.phase == Phase::Idle {
                    return false;
                }
                slot.phase = Phase::Stopping;
                slot.users = 0;
                true
            })
        });
        for (signals, _) in readers.signals.iter().zip(active).filter(|(_, on)| *on) {
            signals.stop.signal(());
        }

        let cancelled = self.stack.transactions.cancel_all(ErrorReason::Terminated);
        info!(
            "[SDP] terminating {} pending transactions",
            cancelled.len()
        );
        self.stack.settle(cancelled);

        for (signals, _) in readers.signals.iter().zip(active).filter(|(_, on)| *on) {
            signals.stopped.wait().await;
        }
    }

    /// Host the reader slots. Never returns; spawn it once next to the stack.
    pub async fn run(&self) {
        join_array(core::array::from_fn::<_, MAX_CONNECTIONS, _>(|index| {
            self.serve(index)
        }))
        .await;
    }

    async fn serve(&self, index: usize) {
        let readers = &self.stack.readers;
        loop {
            readers.signals[index].start.wait().await;
            let connection =
                readers.slots.lock(|slots| slots.borrow()[index].connection.clone());
            let Some(connection) = connection else {
                continue;
            };

            self.read(index, &connection).await;

            readers.set_phase(index, Phase::Stopping);
            self.stack.pool.release(&connection).await;
            readers.finish(index);
            debug!("[SDP] reader {} exited", index);
        }
    }

    async fn read(&self, index: usize, connection: &Arc<Connection<C::Channel>>) {
        let stop = &self.stack.readers.signals[index].stop;
        let mut reader = match select(stop.wait(), connection.reader().lock()).await {
            Either::First(()) => return,
            Either::Second(reader) => reader,
        };

        loop {
            match select(stop.wait(), connection.read_pdu(&mut reader)).await {
                Either::First(()) => {
                    if reader.in_frame() {
                        debug!(
                            "[SDP] reader {} stopped inside a pdu, keeping it for the next reader",
                            index
                        );
                    }
                    return;
                }
                Either::Second(Ok(pdu)) => self.dispatch(index, connection, pdu).await,
                Either::Second(Err(error)) => {
                    if stop.signaled() {
                        return;
                    }
                    warn!(
                        "[SDP] reader for {:?} failed: {:?}",
                        connection.address(),
                        error
                    );
                    self.stack.readers.set_phase(index, Phase::Stopping);
                    // Set before failing the pending transactions, so a
                    // request registered afterwards sees the flag
                    connection.mark_failed();
                    self.fail_connection(connection.address());
                    return;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        index: usize,
        connection: &Arc<Connection<C::Channel>>,
        pdu: InboundPdu,
    ) {
        let address = connection.address();
        let transactions = &self.stack.transactions;
        let Some(pdu_id) = SdpPduId::from_u8(pdu.pdu_id) else {
            warn!(
                "[SDP] unknown pdu {} tid {} from {:?}",
                pdu.pdu_id,
                pdu.transaction_id,
                address
            );
            self.fail_connection(address);
            return;
        };
        trace!(
            "[SDP] received {:?} tid {} ({} bytes)",
            pdu_id,
            pdu.transaction_id,
            pdu.payload.len()
        );

        let Some(key) = transactions.resolve(pdu_id, pdu.transaction_id, address) else {
            self.unmatched(index, address, pdu_id, pdu.transaction_id);
            return;
        };

        match transactions.dispatch(key, pdu_id, &pdu.payload) {
            None => debug!("[SDP] tid {} cancelled while dispatching", key.id),
            Some(Ok(Dispatch::Finished(finished))) => self.stack.settle([finished]),
            Some(Ok(Dispatch::Resend { kind, parameters })) => {
                trace!("[SDP] continuing tid {}", key.id);
                if let Err(error) = connection
                    .send_pdu(kind.request_pdu(), key.id, &parameters)
                    .await
                {
                    warn!(
                        "[SDP] continuation for tid {} failed: {:?}",
                        key.id,
                        error
                    );
                    self.fail_connection(address);
                }
            }
            Some(Err(error)) => {
                warn!(
                    "[SDP] malformed {:?} for tid {}: {:?}",
                    pdu_id,
                    key.id,
                    error
                );
                self.fail_connection(address);
            }
        }
    }

    fn unmatched(
        &self,
        index: usize,
        address: BluetoothAddress,
        pdu_id: SdpPduId,
        id: TransactionId,
    ) {
        if self.stack.readers.signals[index].stop.signaled() {
            trace!("[SDP] discarding tid {} after stop", id);
            return;
        }
        let transactions = &self.stack.transactions;
        let late = match pdu_id.answers() {
            Some(kind) => transactions.is_tombstone(TransactionKey::new(id, kind)),
            None => pdu_id == SdpPduId::ErrorResponse && transactions.is_tombstone_id(id, address),
        };
        if late {
            debug!("[SDP] dropping late {:?} for cancelled tid {}", pdu_id, id);
            return;
        }
        warn!(
            "[SDP] unexpected {:?} tid {} from {:?}",
            pdu_id,
            id,
            address
        );
        self.fail_connection(address);
    }

    fn fail_connection(&self, address: BluetoothAddress) {
        let cancelled = self
            .stack
            .transactions
            .cancel_connection(address, ErrorReason::IoError);
        if !cancelled.is_empty() {
            warn!(
                "[SDP] failing {} transactions on {:?}",
                cancelled.len(),
                address
            );
        }
        self.stack.settle(cancelled);
    }
}
