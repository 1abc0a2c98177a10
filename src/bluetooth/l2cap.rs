//! L2CAP sequenced-packet transport for the AAP channel.
//!
//! The socket is bridged to mpsc channels by a pair of actor tasks so the
//! session never touches it directly. Both actors live in the caller's
//! `JoinSet`; dropping (or aborting) the set releases the transport on
//! every exit path, including failures during session startup.

use std::{sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{PodLinkError, Result};

/// Wire packet; AAP messages are small and usually fit inline.
pub type Packet = SmallVec<[u8; 32]>;

/// PSM on which the accessory protocol is offered.
pub const AAP_PSM: u16 = 0x1001;
/// Largest message the accessory is known to emit.
const L2CAP_MTU: usize = 1024;
/// Timeout for connection attempts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for write acknowledgements from the send actor.
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
///
/// Yields whole messages; the transport preserves packet boundaries.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(PodLinkError::ConnectionClosed)?
   }
}

/// Sender half of an L2CAP connection. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   /// Writes one whole message, waiting for the actor's acknowledgement. A
   /// write that lands short of the full message is an error.
   pub async fn send(&self, data: &[u8]) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| PodLinkError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| PodLinkError::RequestTimeout)?
         .map_err(|_| PodLinkError::ConnectionClosed)?
   }
}

/// Opens the AAP channel to `address` and spawns the transport actors into
/// `jset`.
pub async fn connect(
   jset: &mut JoinSet<()>,
   address: Address,
   psm: Option<u16>,
) -> Result<(L2CapReceiver, L2CapSender)> {
   let socket = Socket::new_seq_packet()?;
   let psm = psm.unwrap_or(AAP_PSM);
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address} psm {psm:#06x}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| PodLinkError::RequestTimeout)??;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_actor(address, in_tx, seq_packet.clone()));
   jset.spawn(send_actor(address, cmd_rx, seq_packet));

   Ok((L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx }))
}

async fn recv_actor(adr: Address, tx: mpsc::Sender<Result<Packet>>, sp: Arc<SeqPacket>) {
   let mut buf = [0u8; L2CAP_MTU];
   loop {
      match sp.recv(&mut buf).await {
         Ok(0) => {
            warn!("{adr}: connection lost");
            let _ = tx.send(Err(PodLinkError::ConnectionLost)).await;
            return;
         },
         Ok(n) => {
            debug!("← {adr}: {}", hex::encode(&buf[..n]));
            if tx.send(Ok(Packet::from_slice(&buf[..n]))).await.is_err() {
               return;
            }
         },
         Err(e) => {
            let _ = tx.send(Err(PodLinkError::Io(e))).await;
            return;
         },
      }
   }
}

async fn send_actor(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(Command::Send { data, then }) = rx.recv().await {
      debug!("→ {adr}: {}", hex::encode(&data));
      let outcome = match sp.send(&data).await {
         Ok(n) if n == data.len() => Ok(()),
         Ok(n) => Err(PodLinkError::ShortWrite {
            expected: data.len(),
            wrote: n,
         }),
         Err(e) => Err(PodLinkError::Io(e)),
      };
      let _ = then.send(outcome);
   }
}

#[cfg(test)]
pub(crate) mod testing {
   use super::*;

   /// Channel-backed transport halves with no socket behind them.
   ///
   /// Inbound packets are fed through the returned sender; everything
   /// written through the [`L2CapSender`] is acknowledged and logged to the
   /// returned receiver.
   pub fn loopback(
      jset: &mut JoinSet<()>,
   ) -> (
      L2CapReceiver,
      L2CapSender,
      mpsc::Sender<Result<Packet>>,
      mpsc::UnboundedReceiver<Packet>,
   ) {
      let (cmd_tx, mut cmd_rx) = mpsc::channel(128);
      let (in_tx, in_rx) = mpsc::channel(128);
      let (sent_tx, sent_rx) = mpsc::unbounded_channel();

      jset.spawn(async move {
         while let Some(Command::Send { data, then }) = cmd_rx.recv().await {
            let _ = sent_tx.send(data);
            let _ = then.send(Ok(()));
         }
      });

      (
         L2CapReceiver { rx: in_rx },
         L2CapSender { tx: cmd_tx },
         in_tx,
         sent_rx,
      )
   }
}
