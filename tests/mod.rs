use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use listener_throttle::{
    net::{Address, Network, TcpAcceptor},
    Error, Op, ThrottledListener,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{sleep, timeout, Instant},
};

async fn bind() -> (Arc<ThrottledListener<TcpAcceptor>>, SocketAddr) {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = acceptor.socket_addr().unwrap();
    (Arc::new(ThrottledListener::new(acceptor)), addr)
}

/// Poll until `done` holds, giving up after five seconds.
async fn settle(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting to settle");
        sleep(Duration::from_millis(1)).await;
    }
}

#[derive(Debug, Default)]
struct Counter {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl Counter {
    fn connect(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn limits_concurrent_connections() {
    let limit = 10;
    let total = 10 * limit;

    let (listener, addr) = bind().await;
    listener.set_max_conns(limit).await;
    let counter = Arc::new(Counter::default());

    let server = tokio::spawn({
        let listener = Arc::clone(&listener);
        let counter = Arc::clone(&counter);
        async move {
            loop {
                let mut conn = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) if err.is_closed() => break,
                    Err(err) => panic!("accept failed: {err}"),
                };

                let state = listener.state();
                assert!(state.active() <= state.limit());

                counter.connect();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    sleep(Duration::from_millis(50)).await;
                    counter.disconnect();
                    conn.close().await.unwrap();
                });
            }
        }
    });

    let clients: Vec<_> = (0..total)
        .map(|_| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let mut buf = Vec::new();
                // The server closes its side once done.
                stream.read_to_end(&mut buf).await.unwrap();
            })
        })
        .collect();

    timeout(Duration::from_secs(30), async {
        for client in clients {
            client.await.unwrap();
        }
    })
    .await
    .expect("clients should all be served");

    listener.close().await.unwrap();
    listener.wait().await;
    server.await.unwrap();

    assert!(counter.max.load(Ordering::SeqCst) <= limit);
    assert_eq!(counter.total.load(Ordering::SeqCst), total);
    assert_eq!(counter.current.load(Ordering::SeqCst), 0);
    assert_eq!(listener.state().active(), 0);
}

#[tokio::test]
async fn converges_on_latest_limit() {
    let (listener, _) = bind().await;
    let max = 200;

    listener.max_conns(max / 2).await;
    settle(|| listener.available() == 100).await;
    assert_eq!(listener.max_conns(-1).await, 100);

    for i in 1..=10 {
        listener.max_conns(max / i).await;
    }
    for i in (1..=10).rev() {
        listener.max_conns(max / i).await;
    }
    for i in 1..=10 {
        listener.max_conns(max / i).await;
        tokio::task::yield_now().await;
    }

    settle(|| listener.available() == 20).await;
    assert_eq!(listener.max_conns(-1).await, 20);
    assert_eq!(listener.state().limit(), 20);

    let (closed, _) = tokio::join!(listener.close(), listener.max_conns(5));
    closed.unwrap();
    listener.wait().await;
}

#[tokio::test]
async fn converges_around_open_connections() {
    let (listener, addr) = bind().await;

    listener.max_conns(5).await;
    settle(|| listener.available() == 5).await;

    let (_client, conn) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let mut conn = conn.unwrap();
    let (_client2, conn2) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let conn2 = conn2.unwrap();
    assert_eq!(listener.available(), 3);

    // Two connections are open, so shrinking to 1 leaves no free slots.
    listener.max_conns(1).await;
    settle(|| listener.state().limit() == 2).await;
    assert_eq!(listener.available(), 0);

    conn.close().await.unwrap();
    settle(|| listener.state().limit() == 1).await;
    assert_eq!(listener.available(), 0);

    drop(conn2);
    settle(|| listener.available() == 1).await;
    assert_eq!(listener.state().limit(), 1);
}

#[tokio::test]
async fn close_twice() {
    let (listener, addr) = bind().await;

    assert!(listener.close().await.is_ok());

    match listener.close().await {
        Err(Error::Closed {
            op,
            net,
            addr: closed_addr,
            ..
        }) => {
            assert_eq!(op, Op::Close);
            assert_eq!(net, Network::Tcp);
            assert_eq!(closed_addr, Address::Inet(addr));
        }
        other => panic!("expected closed error, got {other:?}"),
    }

    listener.wait().await;
}

#[tokio::test]
async fn accept_after_close() {
    let (listener, addr) = bind().await;
    listener.max_conns(3).await;

    listener.close().await.unwrap();
    let err = listener.accept().await.unwrap_err();

    assert!(err.is_closed());
    assert_eq!(
        err.to_string(),
        format!("accept tcp {addr}: use of closed network connection")
    );

    listener.wait().await;
}

#[tokio::test]
async fn close_interrupts_pending_accept() {
    let (listener, _) = bind().await;
    listener.max_conns(1).await;
    settle(|| listener.available() == 1).await;

    let accept = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.accept().await }
    });
    settle(|| listener.available() == 0).await;

    listener.close().await.unwrap();
    listener.wait().await;

    assert!(accept.await.unwrap().unwrap_err().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drains_under_random_resizes() {
    let (listener, addr) = bind().await;
    let max_requested = Arc::new(AtomicUsize::new(8));
    listener.max_conns(8).await;
    let open = Arc::new(AtomicUsize::new(0));

    // Neither the limit nor the open connections may exceed the highest limit requested so far.
    let sampler = tokio::spawn({
        let listener = Arc::clone(&listener);
        let open = Arc::clone(&open);
        let max_requested = Arc::clone(&max_requested);
        async move {
            let mut samples = 0_usize;
            while !listener.is_drained() {
                let limit = listener.state().limit();
                let open = open.load(Ordering::SeqCst);
                let max = max_requested.load(Ordering::SeqCst);
                assert!(limit <= max, "limit {limit} above highest request {max}");
                assert!(open <= max, "{open} open above highest request {max}");
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        }
    });

    let server = tokio::spawn({
        let listener = Arc::clone(&listener);
        let open = Arc::clone(&open);
        async move {
            let mut rng = SmallRng::seed_from_u64(7);
            while let Ok(mut conn) = listener.accept().await {
                open.fetch_add(1, Ordering::SeqCst);

                // This connection's token is held, so the limit cannot drop below one.
                assert!(listener.state().limit() >= 1);

                let hold = Duration::from_millis(rng.gen_range(1..20));
                let open = Arc::clone(&open);
                tokio::spawn(async move {
                    sleep(hold).await;
                    open.fetch_sub(1, Ordering::SeqCst);
                    let _ = conn.close().await;
                });
            }
        }
    });

    let resizer = tokio::spawn({
        let listener = Arc::clone(&listener);
        let max_requested = Arc::clone(&max_requested);
        async move {
            let mut rng = SmallRng::seed_from_u64(11);
            for _ in 0..50 {
                let n = rng.gen_range(1..16);
                max_requested.fetch_max(n, Ordering::SeqCst);
                listener.set_max_conns(n).await;
                sleep(Duration::from_millis(1)).await;
            }
        }
    });

    let clients: Vec<_> = (0..64)
        .map(|_| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let _ = stream.read_to_end(&mut Vec::new()).await;
            })
        })
        .collect();

    resizer.await.unwrap();
    listener.max_conns(8).await;
    for client in clients {
        timeout(Duration::from_secs(30), client)
            .await
            .expect("client should be served")
            .unwrap();
    }

    listener.close().await.unwrap();
    timeout(Duration::from_secs(10), listener.wait())
        .await
        .expect("listener should drain");
    server.await.unwrap();
    assert!(sampler.await.unwrap() > 0);

    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert_eq!(listener.state().active(), 0);
    assert_eq!(listener.state().limit(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn throttles_unix_sockets() {
    use listener_throttle::net::UnixAcceptor;
    use tokio::net::UnixStream;

    let dir = std::env::temp_dir().join(format!("listener-throttle-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("throttled.sock");
    let _ = std::fs::remove_file(&path);

    let listener = ThrottledListener::with_max_conns(UnixAcceptor::bind(&path).unwrap(), 1).await;
    settle(|| listener.available() == 1).await;

    let (_client, conn) = tokio::join!(UnixStream::connect(&path), listener.accept());
    let mut conn = conn.unwrap();
    assert_eq!(listener.available(), 0);

    listener.close().await.unwrap();
    conn.close().await.unwrap();
    listener.wait().await;

    let err = listener.accept().await.unwrap_err();
    assert!(err.to_string().starts_with("accept unix "));

    let _ = std::fs::remove_file(&path);
}
