//! In-memory L2CAP link used by the unit tests
//!
//! The test plays the remote SDP server: it inspects the packets the client
//! sent and pushes response packets into the inbound queue.

use super::{L2capChannel, L2capConnector, ProtocolServiceMultiplexer, TransportError};
use crate::BluetoothAddress;
use alloc::{sync::Arc, vec::Vec};
use core::cell::{Cell, RefCell};
use embassy_sync::{
    blocking_mutex::{Mutex, raw::CriticalSectionRawMutex},
    channel::Channel,
};

enum Inbound {
    Packet(Vec<u8>),
    Closed,
    Fail,
}

pub(crate) struct MockLink {
    address: BluetoothAddress,
    psm: ProtocolServiceMultiplexer,
    transmit_mtu: u16,
    receive_mtu: u16,
    inbound: Channel<CriticalSectionRawMutex, Inbound, 64>,
    sent: Mutex<CriticalSectionRawMutex, RefCell<Vec<Vec<u8>>>>,
    closed: Mutex<CriticalSectionRawMutex, Cell<bool>>,
    close_count: Mutex<CriticalSectionRawMutex, Cell<usize>>,
    fail_sends: Mutex<CriticalSectionRawMutex, Cell<bool>>,
}

impl MockLink {
    pub(crate) fn new(address: BluetoothAddress, transmit_mtu: u16, receive_mtu: u16) -> Self {
        Self {
            address,
            psm: 0,
            transmit_mtu,
            receive_mtu,
            inbound: Channel::new(),
            sent: Mutex::new(RefCell::new(Vec::new())),
            closed: Mutex::new(Cell::new(false)),
            close_count: Mutex::new(Cell::new(0)),
            fail_sends: Mutex::new(Cell::new(false)),
        }
    }

    pub(crate) fn psm(&self) -> ProtocolServiceMultiplexer {
        self.psm
    }

    /// Queue one inbound packet
    pub(crate) fn push(&self, packet: &[u8]) {
        assert!(
            self.inbound.try_send(Inbound::Packet(packet.to_vec())).is_ok(),
            "mock inbound queue full"
        );
    }

    /// Make the next pending or future receive fail with an I/O error
    pub(crate) fn fail_receive(&self) {
        assert!(self.inbound.try_send(Inbound::Fail).is_ok());
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.lock(|f| f.set(true));
    }

    /// Packets sent by the client, in order
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock(|sent| sent.borrow().clone())
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock(|sent| sent.borrow().len())
    }

    /// All sent bytes concatenated
    pub(crate) fn sent_bytes(&self) -> Vec<u8> {
        self.sent().concat()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.lock(Cell::get)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.lock(Cell::get)
    }

    /// Wait until at least `count` packets have been sent
    pub(crate) async fn wait_sent(&self, count: usize) {
        while self.sent_count() < count {
            embassy_futures::yield_now().await;
        }
    }
}

pub(crate) struct MockChannel {
    link: Arc<MockLink>,
}

impl MockChannel {
    pub(crate) fn new(link: Arc<MockLink>) -> Self {
        Self { link }
    }
}

impl L2capChannel for MockChannel {
    async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.link.is_closed() {
            return Err(TransportError::Disconnected);
        }
        if self.link.fail_sends.lock(Cell::get) {
            return Err(TransportError::Io);
        }
        assert!(packet.len() <= usize::from(self.link.transmit_mtu));
        self.link
            .sent
            .lock(|sent| sent.borrow_mut().push(packet.to_vec()));
        Ok(())
    }

    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        if self.link.is_closed() {
            return Err(TransportError::Disconnected);
        }
        match self.link.inbound.receive().await {
            Inbound::Packet(packet) => {
                let target = buffer
                    .get_mut(..packet.len())
                    .ok_or(TransportError::PacketTooLarge)?;
                target.copy_from_slice(&packet);
                Ok(packet.len())
            }
            Inbound::Closed => Err(TransportError::Disconnected),
            Inbound::Fail => Err(TransportError::Io),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.closed.lock(|c| c.set(true));
        self.link.close_count.lock(|c| c.set(c.get() + 1));
        self.link.inbound.try_send(Inbound::Closed).ok();
        Ok(())
    }

    fn transmit_mtu(&self) -> u16 {
        self.link.transmit_mtu
    }

    fn receive_mtu(&self) -> u16 {
        self.link.receive_mtu
    }
}

pub(crate) struct MockConnector {
    transmit_mtu: u16,
    receive_mtu: u16,
    links: Mutex<CriticalSectionRawMutex, RefCell<Vec<Arc<MockLink>>>>,
    refuse: Mutex<CriticalSectionRawMutex, Cell<bool>>,
}

impl MockConnector {
    pub(crate) fn new(transmit_mtu: u16, receive_mtu: u16) -> Self {
        Self {
            transmit_mtu,
            receive_mtu,
            links: Mutex::new(RefCell::new(Vec::new())),
            refuse: Mutex::new(Cell::new(false)),
        }
    }

    pub(crate) fn refuse_connections(&self) {
        self.refuse.lock(|r| r.set(true));
    }

    /// Number of channels opened so far
    pub(crate) fn connect_count(&self) -> usize {
        self.links.lock(|links| links.borrow().len())
    }

    /// Most recently opened link for `address`
    pub(crate) fn link(&self, address: BluetoothAddress) -> Option<Arc<MockLink>> {
        self.links.lock(|links| {
            links
                .borrow()
                .iter()
                .rev()
                .find(|link| link.address == address)
                .cloned()
        })
    }
}

impl L2capConnector for MockConnector {
    type Channel = MockChannel;

    async fn connect(
        &self,
        address: BluetoothAddress,
        psm: ProtocolServiceMultiplexer,
    ) -> Result<MockChannel, TransportError> {
        if self.refuse.lock(Cell::get) {
            return Err(TransportError::ConnectionFailed);
        }
        let mut link = MockLink::new(address, self.transmit_mtu, self.receive_mtu);
        link.psm = psm;
        let link = Arc::new(link);
        self.links
            .lock(|links| links.borrow_mut().push(Arc::clone(&link)));
        Ok(MockChannel::new(link))
    }
}
