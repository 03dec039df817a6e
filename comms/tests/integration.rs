use comms::msg::{Command, Msg, Payload};
use tokio::io::{self, AsyncWriteExt};

#[tokio::test]
async fn control_messages_cross_the_channel() {
    const SIZE: usize = 128;

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx_half, tx_half) = io::split(two);
    let (mut rx, _) = comms::channel(rx_half, tx_half);

    let msg = Msg::Control(Command::Join {
        rank: 1,
        world_size: 2,
    });
    tx.send(&msg).await.unwrap();

    match rx.recv().await.unwrap() {
        Msg::Control(Command::Join { rank, world_size }) => {
            assert_eq!(rank, 1);
            assert_eq!(world_size, 2);
        }
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn gradients_are_received_bit_exact() {
    let (one, two) = io::duplex(4096);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx_half, tx_half) = io::split(two);
    let (mut rx, _) = comms::channel(rx_half, tx_half);

    let grad = [0.5_f32, -1.25, 3.0e-7, f32::MAX];
    tx.send(&Msg::Data(Payload::Gradient(&grad))).await.unwrap();
    tx.send(&Msg::Err("rank 1 failed".into())).await.unwrap();

    let mut buf: Vec<f32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Gradient(got)) => assert_eq!(got, &grad),
        other => panic!("unexpected msg: {other:?}"),
    }

    match rx.recv().await.unwrap() {
        Msg::Err(reason) => assert_eq!(reason, "rank 1 failed"),
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn oversized_frames_are_refused_before_allocating() {
    let (mut raw, two) = io::duplex(64);
    let (rx_half, tx_half) = io::split(two);
    let (mut rx, _) = comms::channel(rx_half, tx_half);

    // A corrupt length prefix claiming a frame of almost 4 GiB.
    raw.write_all(&u64::from(u32::MAX).to_be_bytes()).await.unwrap();

    let mut buf: Vec<f32> = Vec::new();
    let res: io::Result<Msg> = rx.recv_into(&mut buf).await;
    assert_eq!(res.unwrap_err().kind(), io::ErrorKind::InvalidData);
    assert_eq!(buf.capacity(), 0);
}

#[tokio::test]
async fn receivers_admit_gradients_up_to_their_raised_cap() {
    const VALUES: usize = 100_000;

    let (one, two) = io::duplex(4096);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx_half, tx_half) = io::split(two);
    let (mut rx, _) = comms::channel(rx_half, tx_half);
    assert!(comms::msg::gradient_frame_len(VALUES) > rx.max_frame_len());
    rx.set_max_frame_len(comms::msg::gradient_frame_len(VALUES));

    let sender = tokio::spawn(async move {
        let grad = vec![0.25_f32; VALUES];
        tx.send(&Msg::Data(Payload::Gradient(&grad))).await.unwrap();
    });

    let mut buf: Vec<f32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Gradient(got)) => {
            assert_eq!(got.len(), VALUES);
            assert!(got.iter().all(|&g| g == 0.25));
        }
        other => panic!("unexpected msg: {other:?}"),
    }
    sender.await.unwrap();
}
