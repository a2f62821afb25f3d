//! The core stub pipe implementation provided by ferry.

use ferry_api::{builder, config::*, pipe::*, *};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// The core stub pipe implementation provided by ferry.
/// This is NOT a production module. It is for testing only.
/// It will only establish "channels" within the same process.
#[derive(Debug)]
pub struct MemPipeFactory {}

impl MemPipeFactory {
    /// Construct a new MemPipeFactory.
    pub fn create() -> DynPipeFactory {
        let out: DynPipeFactory = Arc::new(MemPipeFactory {});
        out
    }
}

impl PipeFactory for MemPipeFactory {
    fn default_config(&self, _config: &Config) -> FerryResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, FerryResult<DynPipe>> {
        Box::pin(async move {
            let hnd = PipeImpHnd::new();
            let imp = MemPipe::create(hnd.clone()).await;
            Ok(DefaultPipe::create(&hnd, imp))
        })
    }
}

#[derive(Debug)]
struct MemPipe {
    this_url: Url,
    task_list: Arc<Mutex<tokio::task::JoinSet<()>>>,
    cmd_send: CmdSend,
}

impl Drop for MemPipe {
    fn drop(&mut self) {
        self.task_list.lock().unwrap().abort_all();
    }
}

impl MemPipe {
    pub async fn create(hnd: Arc<PipeImpHnd>) -> DynPipeImp {
        let mut listener = get_stat().listen();
        let this_url = listener.url();

        let task_list = Arc::new(Mutex::new(tokio::task::JoinSet::new()));

        let (cmd_send, cmd_recv) =
            tokio::sync::mpsc::unbounded_channel::<Cmd>();

        // listen for incoming channels
        let cmd_send2 = cmd_send.clone();
        task_list.lock().unwrap().spawn(async move {
            while let Some((u, s, r)) = listener.recv.recv().await {
                if cmd_send2.send(Cmd::RegCon(u, s, r)).is_err() {
                    break;
                }
            }
        });

        // our core command runner task
        task_list.lock().unwrap().spawn(cmd_task(
            task_list.clone(),
            hnd,
            this_url.clone(),
            cmd_send.clone(),
            cmd_recv,
        ));

        let out: DynPipeImp = Arc::new(Self {
            this_url,
            task_list,
            cmd_send,
        });

        out
    }
}

impl PipeImp for MemPipe {
    fn url(&self) -> Option<Url> {
        Some(self.this_url.clone())
    }

    fn send(
        &self,
        peer: Url,
        data: bytes::Bytes,
    ) -> BoxFut<'_, FerryResult<()>> {
        Box::pin(async move {
            let (s, r) = tokio::sync::oneshot::channel();
            match self.cmd_send.send(Cmd::Send(peer, data, s)) {
                Err(_) => Err(FerryError::other("channel closed")),
                Ok(_) => match r.await {
                    Ok(r) => r,
                    Err(_) => Err(FerryError::other("channel closed")),
                },
            }
        })
    }

    fn close(&self, peer: Url) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let (s, r) = tokio::sync::oneshot::channel();
            if self.cmd_send.send(Cmd::Close(peer, s)).is_ok() {
                let _ = r.await;
            }
        })
    }
}

type Res = tokio::sync::oneshot::Sender<FerryResult<()>>;
type CmdSend = tokio::sync::mpsc::UnboundedSender<Cmd>;
type CmdRecv = tokio::sync::mpsc::UnboundedReceiver<Cmd>;
type DataSend = tokio::sync::mpsc::UnboundedSender<(bytes::Bytes, Res)>;
type DataRecv = tokio::sync::mpsc::UnboundedReceiver<(bytes::Bytes, Res)>;
type ConSend = tokio::sync::mpsc::UnboundedSender<(Url, DataSend, DataRecv)>;
type ConRecv = tokio::sync::mpsc::UnboundedReceiver<(Url, DataSend, DataRecv)>;

enum Cmd {
    RegCon(Url, DataSend, DataRecv),
    InData(Url, bytes::Bytes, Res),
    Close(Url, Res),
    Send(Url, bytes::Bytes, Res),
}

async fn cmd_task(
    task_list: Arc<Mutex<tokio::task::JoinSet<()>>>,
    hnd: Arc<PipeImpHnd>,
    this_url: Url,
    cmd_send: CmdSend,
    mut cmd_recv: CmdRecv,
) {
    let mut con_pool = HashMap::new();

    while let Some(cmd) = cmd_recv.recv().await {
        match cmd {
            Cmd::RegCon(url, data_send, mut data_recv) => {
                let cmd_send2 = cmd_send.clone();
                let url2 = url.clone();
                task_list.lock().unwrap().spawn(async move {
                    while let Some((data, res)) = data_recv.recv().await {
                        if cmd_send2
                            .send(Cmd::InData(url2.clone(), data, res))
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                con_pool.insert(url, data_send);
            }
            Cmd::InData(url, data, res) => {
                // An undecodable frame is logged and dropped; the
                // channel itself stays usable.
                if let Err(err) = hnd.recv_data(url.clone(), data) {
                    tracing::warn!(peer = %url, "dropping frame: {err}");
                }
                let _ = res.send(Ok(()));
            }
            Cmd::Close(url, res) => {
                con_pool.remove(&url);
                let _ = res.send(Ok(()));
            }
            Cmd::Send(url, data, res) => {
                match get_stat().connect(
                    &cmd_send,
                    &mut con_pool,
                    &url,
                    &this_url,
                ) {
                    Some(send) => {
                        let _ = send.send((data, res));
                    }
                    None => {
                        let _ = res.send(Err(FerryError::other(format!(
                            "could not open channel to {url}"
                        ))));
                    }
                }
            }
        }
    }
}

/// A Listener instance is the receiver side of a pseudo channel.
/// If this is dropped by test code, it will remove the sender side
/// from our static global.
struct Listener {
    id: u64,
    url: Url,
    recv: ConRecv,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("url", &self.url).finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        get_stat().remove(self.id);
    }
}

impl Listener {
    pub fn url(&self) -> Url {
        self.url.clone()
    }
}

/// This struct will be instantiated as a static global called STAT.
/// The purpose is to hold the sender side of channels that let us
/// open "channels" to endpoints. These senders will remain in memory
/// until the [Listener] instance is dropped.
struct Stat {
    con_map: Mutex<HashMap<u64, ConSend>>,
}

impl Stat {
    fn new() -> Self {
        Self {
            con_map: Mutex::new(HashMap::new()),
        }
    }

    /// "Bind" a new [Listener].
    fn listen(&self) -> Listener {
        use std::sync::atomic::*;
        static ID: AtomicU64 = AtomicU64::new(1);
        let id = ID.fetch_add(1, Ordering::Relaxed);
        let url = Url::from_str(format!("ws://mem.pipe:42/{id}")).unwrap();
        let (send, recv) = tokio::sync::mpsc::unbounded_channel();
        self.con_map.lock().unwrap().insert(id, send);
        Listener { id, url, recv }
    }

    /// Remove a sender. Called by [Listener::drop].
    fn remove(&self, id: u64) {
        self.con_map.lock().unwrap().remove(&id);
    }

    /// If the destination peer is still in memory, this will
    /// establish an in-memory "channel" to them.
    fn connect(
        &self,
        cmd_send: &CmdSend,
        map: &mut HashMap<Url, DataSend>,
        to_peer: &Url,
        from_peer: &Url,
    ) -> Option<DataSend> {
        if let Some(send) = map.get(to_peer) {
            return Some(send.clone());
        }

        let id: u64 = match to_peer.peer_id() {
            None => return None,
            Some(id) => match id.parse() {
                Err(_) => return None,
                Ok(id) => id,
            },
        };

        let send = match self.con_map.lock().unwrap().get(&id) {
            None => return None,
            Some(send) => send.clone(),
        };

        let (ds1, dr1) = tokio::sync::mpsc::unbounded_channel();
        let (ds2, dr2) = tokio::sync::mpsc::unbounded_channel();

        if send.send((from_peer.clone(), ds1, dr2)).is_err() {
            return None;
        }

        let _ = cmd_send.send(Cmd::RegCon(to_peer.clone(), ds2.clone(), dr1));

        Some(ds2)
    }
}

/// This is our static global instance of the [Stat] struct.
static STAT: OnceLock<Stat> = OnceLock::new();
fn get_stat() -> &'static Stat {
    STAT.get_or_init(Stat::new)
}

#[cfg(test)]
mod test;
