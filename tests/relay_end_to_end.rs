// End-to-end relay tests: a near node and a far node run in-process, connected
// by a loopback transport that delivers into the peer's spool the way the
// bundle agent does (as `testfile<N>`).

use async_trait::async_trait;
use spoolrelay::fetch::Fetcher;
use spoolrelay::{node, RelayConfig, RelayError, RequestDescriptor, RequestId, Resolution, Role};
use spoolrelay::{Gateway, Transport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const KIB: usize = 1024;

/// Delivers each sent file into `peer_spool` under the next `testfile<N>` name
struct Loopback {
    peer_spool: PathBuf,
    next: AtomicUsize,
    /// Number every delivery 1, like a listener restarted after each send
    restart_numbering: bool,
    sent: Mutex<Vec<String>>,
}

impl Loopback {
    fn new(peer_spool: &Path) -> Arc<Self> {
        Arc::new(Self {
            peer_spool: peer_spool.to_path_buf(),
            next: AtomicUsize::new(1),
            restart_numbering: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn restarting(peer_spool: &Path) -> Arc<Self> {
        Arc::new(Self {
            peer_spool: peer_spool.to_path_buf(),
            next: AtomicUsize::new(1),
            restart_numbering: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn start_listening(&self) -> spoolrelay::Result<()> {
        Ok(())
    }

    async fn cancel(&self) {}

    async fn send(&self, file: &Path) -> spoolrelay::Result<()> {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        let n = if self.restart_numbering { 1 } else { seq };
        let target = self.peer_spool.join(format!("testfile{n}"));
        // The agent reuses a name only after the previous file was taken
        for _ in 0..1000 {
            if !target.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let staging = self.peer_spool.join(format!(".incoming{seq}"));
        tokio::fs::copy(file, &staging).await?;
        tokio::fs::rename(&staging, &target).await?;

        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        self.sent.lock().unwrap().push(name);
        Ok(())
    }

    async fn is_listening(&self) -> bool {
        true
    }
}

/// Mirrors any example.com URL as a three-file page, 400 KiB per file
struct PageFetcher;

#[async_trait]
impl Fetcher for PageFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> spoolrelay::Result<()> {
        let Some(path) = url.strip_prefix("https://example.com/") else {
            return Err(RelayError::FetchFailure {
                url: url.to_string(),
                reason: "unknown host".to_string(),
            });
        };
        let page = dest.join("example.com").join(path);
        tokio::fs::create_dir_all(&page).await?;
        for (name, byte) in [("index.html", b'i'), ("logo.png", b'l'), ("style.css", b's')] {
            tokio::fs::write(page.join(name), vec![byte; 400 * KIB]).await?;
        }
        Ok(())
    }
}

struct Node {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Node {
    fn start(config: RelayConfig, transport: Arc<Loopback>) -> Self {
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(node::run_with(
            config,
            transport,
            Arc::new(PageFetcher),
            async move {
                let _ = stopped.await;
            },
        ));
        Self { stop, handle }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

fn config(role: Role, spool: &Path) -> RelayConfig {
    let mut config = RelayConfig::for_role(role);
    config.spool_dir = spool.to_path_buf();
    config.stability.poll_interval_ms = 1;
    config.finalize().unwrap()
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    done()
}

fn request_files(spool: &Path) -> Vec<String> {
    std::fs::read_dir(spool)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n.starts_with("request_"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_page_relayed_in_three_chunks_then_served_from_cache() {
    let tmp = TempDir::new().unwrap();
    let near_spool = tmp.path().join("near");
    let far_spool = tmp.path().join("far");
    std::fs::create_dir_all(&near_spool).unwrap();
    std::fs::create_dir_all(&far_spool).unwrap();

    let near_config = config(Role::Near, &near_spool);
    let cache = near_config.cache_dir();
    let to_far = Loopback::new(&far_spool);
    let to_near = Loopback::new(&near_spool);
    let near = Node::start(near_config.clone(), to_far.clone());
    let far = Node::start(config(Role::Far, &far_spool), to_near.clone());

    // What the gateway writes on a cache miss, with a fixed correlation ID
    let descriptor =
        RequestDescriptor::new("https://example.com/page", RequestId::parse("0001234").unwrap());
    let staging = near_spool.join(".descriptor");
    std::fs::write(&staging, descriptor.encode()).unwrap();
    std::fs::rename(&staging, near_spool.join("request_2024-01-01T00-00-00.000Z_0001234.txt"))
        .unwrap();

    let page = cache.join("example.com/page");
    let merged = wait_for(|| {
        ["index.html", "logo.png", "style.css"]
            .iter()
            .all(|f| page.join(f).is_file())
    })
    .await;
    assert!(merged, "cache never populated");

    assert_eq!(to_far.sent().len(), 1);
    let mut chunks = to_near.sent();
    chunks.sort();
    assert_eq!(
        chunks,
        vec![
            "processed_0001234_1.zip",
            "processed_0001234_2.zip",
            "processed_0001234_3.zip",
        ]
    );
    for (name, byte) in [("index.html", b'i'), ("logo.png", b'l'), ("style.css", b's')] {
        assert_eq!(std::fs::read(page.join(name)).unwrap(), vec![byte; 400 * KIB]);
    }

    // Second phase: the same URL is now answered from the cache
    let gateway = Gateway::from_config(&near_config);
    let resolution = gateway.resolve("https://example.com/page").await.unwrap();
    assert_eq!(
        resolution,
        Resolution::Served {
            path: page.join("index.html")
        }
    );
    assert!(wait_for(|| request_files(&near_spool).is_empty()).await);

    // Far scratch and chunk archives are cleaned up after sending
    let far_clean = wait_for(|| {
        std::fs::read_dir(&far_spool).unwrap().all(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            !(name.starts_with("download_")
                || name.starts_with("divided_")
                || name.starts_with("processed_"))
        })
    })
    .await;
    assert!(far_clean, "far scratch left behind");

    near.shutdown().await;
    far.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_round_trip() {
    let tmp = TempDir::new().unwrap();
    let near_spool = tmp.path().join("near");
    let far_spool = tmp.path().join("far");
    std::fs::create_dir_all(&near_spool).unwrap();
    std::fs::create_dir_all(&far_spool).unwrap();

    let near_config = config(Role::Near, &near_spool);
    let near = Node::start(near_config.clone(), Loopback::new(&far_spool));
    let far = Node::start(config(Role::Far, &far_spool), Loopback::new(&near_spool));

    let gateway = Gateway::from_config(&near_config);
    let first = gateway.resolve("https://example.com/page").await.unwrap();
    assert_eq!(first.status(), 202);
    let token = first.token().cloned().unwrap();

    let mut served = None;
    for _ in 0..400 {
        let next = gateway.resolve("https://example.com/page").await.unwrap();
        if next.status() == 200 {
            served = Some(next);
            break;
        }
        // Until the cache fills, repeats get the original token
        assert_eq!(next, Resolution::Pending { token: token.clone() });
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(served.is_some(), "never served from cache");
    assert!(wait_for(|| request_files(&near_spool).is_empty()).await);

    near.shutdown().await;
    far.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reused_delivery_names_lose_nothing() {
    let tmp = TempDir::new().unwrap();
    let near_spool = tmp.path().join("near");
    let far_spool = tmp.path().join("far");
    std::fs::create_dir_all(&near_spool).unwrap();
    std::fs::create_dir_all(&far_spool).unwrap();

    let near_config = config(Role::Near, &near_spool);
    let to_far = Loopback::restarting(&far_spool);
    let to_near = Loopback::restarting(&near_spool);
    let near = Node::start(near_config.clone(), to_far.clone());
    let far = Node::start(config(Role::Far, &far_spool), to_near.clone());

    // Both descriptors reach the far spool as `testfile1`, the second while
    // the first request is still being fetched and sent
    let gateway = Gateway::from_config(&near_config);
    for url in ["https://example.com/page", "https://example.com/other"] {
        assert_eq!(gateway.resolve(url).await.unwrap().status(), 202);
    }

    let cache = near_config.cache_dir().join("example.com");
    let merged = wait_for(|| {
        ["page", "other"].iter().all(|dir| {
            ["index.html", "logo.png", "style.css"]
                .iter()
                .all(|f| cache.join(dir).join(f).is_file())
        })
    })
    .await;
    assert!(merged, "a reused delivery name was dropped");
    assert_eq!(to_far.sent().len(), 2);
    assert_eq!(to_near.sent().len(), 6);

    near.shutdown().await;
    far.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_fetch_leaves_cache_empty() {
    let tmp = TempDir::new().unwrap();
    let near_spool = tmp.path().join("near");
    let far_spool = tmp.path().join("far");
    std::fs::create_dir_all(&near_spool).unwrap();
    std::fs::create_dir_all(&far_spool).unwrap();

    let near_config = config(Role::Near, &near_spool);
    let to_far = Loopback::new(&far_spool);
    let to_near = Loopback::new(&near_spool);
    let near = Node::start(near_config.clone(), to_far.clone());
    let far = Node::start(config(Role::Far, &far_spool), to_near.clone());

    let gateway = Gateway::from_config(&near_config);
    let first = gateway.resolve("https://unreachable.test/").await.unwrap();
    assert_eq!(first.status(), 202);

    assert!(wait_for(|| to_far.sent().len() == 1).await);
    // Give the far node time to fetch and drop the request
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(to_near.sent().is_empty());
    assert!(!near_config.cache_dir().join("unreachable.test").exists());
    let again = gateway.resolve("https://unreachable.test/").await.unwrap();
    assert!(matches!(again, Resolution::Pending { .. }));

    near.shutdown().await;
    far.shutdown().await;
}
