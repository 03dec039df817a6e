use std::{borrow::Cow, time::Duration};

use comms::{
    DEFAULT_MAX_FRAME_LEN, OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload, gradient_frame_len},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::{self, Instant},
};

use super::{
    error::{GroupErr, Result},
    group::{RunGroup, WRITER_RANK},
};

const RETRY_DELAY: Duration = Duration::from_millis(250);

/// One framed connection.
pub type Link<R, W> = (OnoReceiver<R>, OnoSender<W>);

enum Role<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Rank 0, connected to every other rank; `peers[i]` is rank `i + 1`.
    Hub { peers: Vec<Link<R, W>> },
    Peer { hub: Link<R, W> },
}

/// A run group of processes connected in a star around rank 0.
///
/// Peers report to the hub and wait for its verdict; the hub folds their
/// contributions with its own and answers everyone. Any connection failure is
/// fatal for the run.
pub struct NetGroup<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    world_size: usize,
    role: Mutex<Role<R, W>>,
}

impl NetGroup<OwnedReadHalf, OwnedWriteHalf> {
    /// Forms the group over TCP.
    ///
    /// Rank 0 listens on `addr` for the other ranks, every other rank dials it,
    /// retrying until `timeout` since the hub may come up later.
    ///
    /// # Arguments
    /// * `rank` - This process' rank.
    /// * `world_size` - Number of ranks in the group.
    /// * `addr` - The hub's address.
    /// * `timeout` - How long to wait for the group to form.
    pub async fn connect(
        rank: usize,
        world_size: usize,
        addr: &str,
        timeout: Duration,
    ) -> Result<Self> {
        if rank == WRITER_RANK {
            let listener = TcpListener::bind(addr).await?;
            info!("listening for {} peer(s) at {addr}", world_size - 1);

            let mut links = Vec::with_capacity(world_size - 1);
            let deadline = Instant::now() + timeout;
            for _ in 1..world_size {
                let (stream, from) = time::timeout_at(deadline, listener.accept())
                    .await
                    .map_err(|_| GroupErr::Timeout(format!("waiting for peers at {addr}")))??;

                debug!("peer connected from {from}");
                stream.set_nodelay(true)?;
                let (rx, tx) = stream.into_split();
                links.push(comms::channel(rx, tx));
            }

            return time::timeout_at(deadline, Self::hub(world_size, links))
                .await
                .map_err(|_| GroupErr::Timeout("waiting for peers to join".into()))?;
        }

        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("hub at {addr} not reachable yet: {e}");
                    time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Self::peer(rank, world_size, rx, tx).await
    }
}

impl<R, W> NetGroup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Builds rank 0 from one link per peer, in any order.
    ///
    /// Each peer must first announce itself with `Join`.
    pub async fn hub(world_size: usize, links: Vec<Link<R, W>>) -> Result<Self> {
        if links.len() + 1 != world_size {
            return Err(GroupErr::Protocol(format!(
                "hub of {world_size} ranks got {} peer link(s)",
                links.len()
            )));
        }

        let mut slots: Vec<Option<Link<R, W>>> = (1..world_size).map(|_| None).collect();
        for (mut rx, tx) in links {
            let msg: Msg = rx.recv().await?;
            let (rank, theirs) = match msg {
                Msg::Control(Command::Join { rank, world_size }) => (rank, world_size),
                other => return Err(unexpected(None, other)),
            };

            if theirs != world_size || rank == WRITER_RANK || rank >= world_size {
                return Err(GroupErr::Protocol(format!(
                    "peer joined as rank {rank} of {theirs}, group has {world_size} ranks"
                )));
            }

            let slot = &mut slots[rank - 1];
            if slot.is_some() {
                return Err(GroupErr::Protocol(format!("rank {rank} joined twice")));
            }
            *slot = Some((rx, tx));
            debug!(rank = rank; "peer joined");
        }

        let peers = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GroupErr::Protocol("a rank never joined".into()))?;

        info!("run group of {world_size} formed");
        Ok(Self {
            rank: WRITER_RANK,
            world_size,
            role: Mutex::new(Role::Hub { peers }),
        })
    }

    /// Builds a non-zero rank from its link to the hub and announces it.
    pub async fn peer(
        rank: usize,
        world_size: usize,
        rx: OnoReceiver<R>,
        mut tx: OnoSender<W>,
    ) -> Result<Self> {
        tx.send(&Msg::Control(Command::Join { rank, world_size }))
            .await?;

        Ok(Self {
            rank,
            world_size,
            role: Mutex::new(Role::Peer { hub: (rx, tx) }),
        })
    }
}

fn unexpected(rank: Option<usize>, msg: Msg<'_>) -> GroupErr {
    match (rank, msg) {
        (Some(rank), Msg::Err(reason)) => GroupErr::Aborted {
            rank,
            reason: reason.into_owned(),
        },
        (None, Msg::Err(reason)) => GroupErr::Aborted {
            rank: WRITER_RANK,
            reason: reason.into_owned(),
        },
        (rank, other) => GroupErr::Protocol(format!(
            "{} sent {} out of turn",
            rank.map_or("a peer".to_string(), |r| format!("rank {r}")),
            other.kind()
        )),
    }
}

async fn broadcast<R, W>(peers: &mut [Link<R, W>], msg: &Msg<'_>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for (i, (_, tx)) in peers.iter_mut().enumerate() {
        if let Err(e) = tx.send(msg).await {
            debug!(rank = i + 1; "failed to notify peer: {e}");
        }
    }
}

async fn send_all<R, W>(peers: &mut [Link<R, W>], msg: &Msg<'_>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for (_, tx) in peers.iter_mut() {
        tx.send(msg).await?;
    }

    Ok(())
}

async fn hub_barrier<R, W>(peers: &mut [Link<R, W>], step: u64, stop: bool) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut any = stop;
    for (i, (rx, _)) in peers.iter_mut().enumerate() {
        let rank = i + 1;
        let msg: Msg = rx.recv().await?;
        match msg {
            Msg::Control(Command::Arrive { step: theirs, stop }) if theirs == step => any |= stop,
            Msg::Control(Command::Arrive { step: got, .. }) => {
                return Err(GroupErr::StepSkew {
                    rank,
                    expected: step,
                    got,
                });
            }
            other => return Err(unexpected(Some(rank), other)),
        }
    }

    send_all(peers, &Msg::Control(Command::Release { step, stop: any })).await?;
    Ok(any)
}

async fn hub_reduce<R, W>(peers: &mut [Link<R, W>], buf: &mut [f32]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sum = buf.to_vec();
    for (i, (rx, _)) in peers.iter_mut().enumerate() {
        let rank = i + 1;
        expect_gradient(rx, buf.len());
        let msg: Msg = rx.recv().await?;
        match msg {
            Msg::Data(Payload::Gradient(grad)) if grad.len() == sum.len() => {
                sum.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
            }
            Msg::Data(Payload::Gradient(grad)) => {
                return Err(GroupErr::Protocol(format!(
                    "rank {rank} reduced {} values, expected {}",
                    grad.len(),
                    sum.len()
                )));
            }
            other => return Err(unexpected(Some(rank), other)),
        }
    }

    let scale = 1. / (peers.len() + 1) as f32;
    buf.iter_mut()
        .zip(&sum)
        .for_each(|(out, total)| *out = total * scale);

    send_all(peers, &Msg::Data(Payload::Gradient(buf))).await
}

/// Lets `rx` take a gradient of `values` floats and nothing larger.
fn expect_gradient<R: AsyncRead + Unpin>(rx: &mut OnoReceiver<R>, values: usize) {
    rx.set_max_frame_len(gradient_frame_len(values).max(DEFAULT_MAX_FRAME_LEN));
}

async fn hub_agree<R, W>(peers: &mut [Link<R, W>], digest: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut mismatch = None;
    for (i, (rx, _)) in peers.iter_mut().enumerate() {
        let rank = i + 1;
        let msg: Msg = rx.recv().await?;
        match msg {
            Msg::Control(Command::Digest { digest: theirs }) => {
                if theirs != digest && mismatch.is_none() {
                    mismatch = Some((rank, theirs));
                }
            }
            other => return Err(unexpected(Some(rank), other)),
        }
    }

    let Some((rank, got)) = mismatch else {
        return send_all(peers, &Msg::Control(Command::Agreed)).await;
    };

    let verdict = Command::Mismatch {
        rank,
        expected: digest.to_string(),
        got: got.clone(),
    };
    broadcast(peers, &Msg::Control(verdict)).await;
    Err(GroupErr::Mismatch {
        rank,
        expected: digest.to_string(),
        got,
    })
}

async fn peer_barrier<R, W>(hub: &mut Link<R, W>, step: u64, stop: bool) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (rx, tx) = hub;
    tx.send(&Msg::Control(Command::Arrive { step, stop }))
        .await?;

    let msg: Msg = rx.recv().await?;
    match msg {
        Msg::Control(Command::Release { step: released, stop }) if released == step => Ok(stop),
        Msg::Control(Command::Release { step: got, .. }) => Err(GroupErr::StepSkew {
            rank: WRITER_RANK,
            expected: step,
            got,
        }),
        other => Err(unexpected(None, other)),
    }
}

async fn peer_reduce<R, W>(hub: &mut Link<R, W>, buf: &mut [f32]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (rx, tx) = hub;
    tx.send(&Msg::Data(Payload::Gradient(buf))).await?;

    expect_gradient(rx, buf.len());
    let msg: Msg = rx.recv().await?;
    match msg {
        Msg::Data(Payload::Gradient(mean)) if mean.len() == buf.len() => {
            buf.copy_from_slice(mean);
            Ok(())
        }
        Msg::Data(Payload::Gradient(mean)) => Err(GroupErr::Protocol(format!(
            "hub sent {} mean values, expected {}",
            mean.len(),
            buf.len()
        ))),
        other => Err(unexpected(None, other)),
    }
}

async fn peer_agree<R, W>(hub: &mut Link<R, W>, digest: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (rx, tx) = hub;
    tx.send(&Msg::Control(Command::Digest {
        digest: digest.to_string(),
    }))
    .await?;

    let msg: Msg = rx.recv().await?;
    match msg {
        Msg::Control(Command::Agreed) => Ok(()),
        Msg::Control(Command::Mismatch {
            rank,
            expected,
            got,
        }) => Err(GroupErr::Mismatch {
            rank,
            expected,
            got,
        }),
        other => Err(unexpected(None, other)),
    }
}

impl<R, W> RunGroup for NetGroup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier(&self, step: u64, stop: bool) -> Result<bool> {
        let mut role = self.role.lock().await;
        match &mut *role {
            Role::Hub { peers } => {
                let res = hub_barrier(peers, step, stop).await;
                if let Err(e) = &res {
                    broadcast(peers, &Msg::Err(Cow::Owned(e.to_string()))).await;
                }
                res
            }
            Role::Peer { hub } => peer_barrier(hub, step, stop).await,
        }
    }

    async fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        let mut role = self.role.lock().await;
        match &mut *role {
            Role::Hub { peers } => {
                let res = hub_reduce(peers, buf).await;
                if let Err(e) = &res {
                    broadcast(peers, &Msg::Err(Cow::Owned(e.to_string()))).await;
                }
                res
            }
            Role::Peer { hub } => peer_reduce(hub, buf).await,
        }
    }

    async fn agree(&self, digest: &str) -> Result<()> {
        let mut role = self.role.lock().await;
        match &mut *role {
            Role::Hub { peers } => {
                let res = hub_agree(peers, digest).await;
                if let Err(e @ (GroupErr::Aborted { .. } | GroupErr::Protocol(_) | GroupErr::Io(_))) =
                    &res
                {
                    broadcast(peers, &Msg::Err(Cow::Owned(e.to_string()))).await;
                }
                res
            }
            Role::Peer { hub } => peer_agree(hub, digest).await,
        }
    }

    async fn abort(&self, reason: &str) {
        let notice = format!("rank {}: {reason}", self.rank);
        let msg = Msg::Err(Cow::Borrowed(&notice));

        let mut role = self.role.lock().await;
        match &mut *role {
            Role::Hub { peers } => broadcast(peers, &msg).await,
            Role::Peer { hub: (_, tx) } => {
                if let Err(e) = tx.send(&msg).await {
                    warn!("failed to tell the hub about the failure: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{DuplexStream, ReadHalf, WriteHalf, duplex, split},
        task::JoinSet,
    };

    use super::*;

    type Half = NetGroup<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    async fn group(world_size: usize) -> Vec<Half> {
        let mut hub_links = Vec::new();
        let mut peers = Vec::new();

        // Join out of order to exercise the hub's slotting.
        for rank in (1..world_size).rev() {
            let (a, b) = duplex(1 << 16);
            let (ar, aw) = split(a);
            let (br, bw) = split(b);
            hub_links.push(comms::channel(ar, aw));

            let (rx, tx) = comms::channel(br, bw);
            peers.push(Half::peer(rank, world_size, rx, tx).await.unwrap());
        }

        let hub = Half::hub(world_size, hub_links).await.unwrap();
        peers.reverse();
        let mut all = vec![hub];
        all.extend(peers);
        all
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn collectives_match_across_ranks() {
        let mut tasks = JoinSet::new();
        for g in group(3).await {
            tasks.spawn(async move {
                let r = g.rank() as f32;
                let mut grads = vec![r; 1000];
                g.all_reduce_mean(&mut grads).await.unwrap();

                let quiet = g.barrier(1, false).await.unwrap();
                let vote = g.barrier(2, g.rank() == 1).await.unwrap();
                g.agree("same").await.unwrap();
                (grads, quiet, vote)
            });
        }

        while let Some(res) = tasks.join_next().await {
            let (grads, quiet, vote) = res.unwrap();
            assert!(grads.iter().all(|&g| g == 1.0));
            assert!(!quiet);
            assert!(vote);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn digest_mismatch_reaches_everyone() {
        let mut tasks = JoinSet::new();
        for g in group(3).await {
            tasks.spawn(async move {
                let digest = if g.rank() == 2 { "other" } else { "same" };
                g.agree(digest).await
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert!(matches!(
                res.unwrap(),
                Err(GroupErr::Mismatch { rank: 2, .. })
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_abort_unwinds_the_group() {
        let mut all = group(3).await;
        let failing = all.pop().unwrap();
        let mut tasks = JoinSet::new();
        for g in all {
            tasks.spawn(async move { g.barrier(1, false).await });
        }

        failing.abort("out of memory").await;

        while let Some(res) = tasks.join_next().await {
            let err = res.unwrap().unwrap_err();
            assert!(err.to_string().contains("out of memory"), "{err}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hub_refuses_a_gradient_larger_than_its_own() {
        let mut all = group(2).await;
        let peer = all.pop().unwrap();
        let hub = all.pop().unwrap();

        let oversized = tokio::spawn(async move {
            let mut grads = vec![1.0; 100_000];
            peer.all_reduce_mean(&mut grads).await
        });

        let mut grads = vec![0.0; 4];
        let err = hub.all_reduce_mean(&mut grads).await.unwrap_err();
        assert!(
            matches!(err, GroupErr::Io(ref e) if e.kind() == std::io::ErrorKind::InvalidData),
            "{err}"
        );
        oversized.abort();
    }

    #[tokio::test]
    async fn hub_rejects_a_stranger() {
        let (a, b) = duplex(1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        let (rx, tx) = comms::channel(br, bw);
        let _peer = Half::peer(5, 2, rx, tx).await.unwrap();

        let err = Half::hub(2, vec![comms::channel(ar, aw)]).await.err().unwrap();
        assert!(matches!(err, GroupErr::Protocol(_)));
    }
}
