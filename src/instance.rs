//! The instance supervisor: composes the caches, the source graphs, the
//! ZDR coordinator and the server set, and owns their lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::{PageCache, ServletCache};
use crate::config::{Config, ServletConfig};
use crate::error::{Result, RspError};
use crate::logger::is_dev_mode;
use crate::server::{set::ServerSet, HttpServer, ServeContext};
use crate::template::base_helpers;
use crate::toolchain::RustTool;
use crate::util;
use crate::zdr::{ConnSock, Handoff, Zdr};
use crate::{debug, log};

/// How long a starting process waits for the incumbent master to hand
/// over its sockets.
const ZDR_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// One complete program instance. Everything hangs off this value so
/// tests can run isolated instances concurrently.
pub struct Instance {
    rspdir: PathBuf,
    config: Config,
    /// App-specific data cache, unique per pub dir.
    app_cache_dir: PathBuf,
    servers: ServerSet,
    page_cache: Option<Arc<PageCache>>,
    servlet_cache: Option<Arc<ServletCache>>,
    zdr: Mutex<Option<Arc<Zdr>>>,
    me: Weak<Instance>,
}

impl Instance {
    pub fn new(rspdir: PathBuf, config: Config) -> Result<Arc<Instance>> {
        if config.servers.is_empty() {
            return Err(RspError::ConfigInvalid("no servers configured".into()));
        }

        // cache dirs rooted in the shared install dir are namespaced per
        // pub dir so instances do not trample each other
        let app_cache_dir = if config.cache_dir.starts_with(&rspdir) {
            config.cache_dir.join(util::pubdir_slug(&config.pub_dir))
        } else {
            config.cache_dir.clone()
        };

        // pages system
        let page_cache = config.pages.enabled.then(|| {
            Arc::new(PageCache::new(
                config.pub_dir.clone(),
                Some(config.pages.file_ext.as_str()),
                Arc::new(base_helpers()),
            ))
        });

        // servlet system
        let servlet_cache = if config.servlet.enabled {
            Some(init_servlets(&config, &app_cache_dir)?)
        } else {
            None
        };

        let ctx = Arc::new(ServeContext {
            pubdir: config.pub_dir.clone(),
            pages: page_cache.clone(),
            servlets: servlet_cache.clone(),
        });

        let servers = ServerSet::new(
            config
                .servers
                .iter()
                .map(|sc| Arc::new(HttpServer::new(ctx.clone(), sc.clone())))
                .collect(),
        );

        Ok(Arc::new_cyclic(|me| Instance {
            rspdir,
            config,
            app_cache_dir,
            servers,
            page_cache,
            servlet_cache,
            zdr: Mutex::new(None),
            me: me.clone(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn servers(&self) -> &ServerSet {
        &self.servers
    }

    /// Run the instance: preload, acquire the ZDR master role, listen,
    /// serve until shutdown. Blocks for the life of the process.
    pub fn main(&self) -> Result<()> {
        if is_dev_mode() {
            log!("rsp"; "running in development mode");
            if let Ok(yaml) = serde_yaml::to_string(&self.config) {
                println!("----\n{yaml}----");
            }
            println!("  appCacheDir: {}", self.app_cache_dir.display());
        }

        if let Some(sc) = &self.servlet_cache {
            if self.config.servlet.preload {
                sc.load_all()?;
            }
        }

        // existing listening sockets, passed on from a past process
        let mut inherited: Vec<ConnSock> = Vec::new();

        // zero-downtime restart coordination (blocks on the handoff)
        if self.config.zdr.enabled {
            let zdr = self.start_zdr()?;
            inherited = zdr.acquire_master_role(ZDR_ACQUIRE_TIMEOUT)?;
            *self.zdr.lock() = Some(zdr);
        }

        // start listening for incoming connections
        self.servers.listen(inherited)?;

        // serve; blocks until all servers are done
        let served = self.servers.serve();

        // await any handoff-initiated graceful shutdown
        let zdr = self.zdr.lock().take();
        if let Some(zdr) = zdr {
            let result = zdr.await_shutdown();
            zdr.close();
            result?;
        }

        served
    }

    /// Graceful shutdown: stop accepting, stop servlets, close graphs.
    pub fn shutdown(&self) {
        debug!("rsp"; "graceful shutdown initiated");
        self.servers.shutdown();
        if let Some(sc) = &self.servlet_cache {
            sc.shutdown();
        }
        debug!("rsp"; "graceful shutdown completed");
    }

    /// Immediate teardown.
    pub fn close(&self) {
        self.servers.close();
        if let Some(sc) = &self.servlet_cache {
            sc.shutdown();
        }
        if let Some(zdr) = self.zdr.lock().take() {
            zdr.close();
        }
    }

    fn start_zdr(&self) -> Result<Arc<Zdr>> {
        // by default the socket lives in the app cache dir; a custom
        // group shares a socket bucket under the install dir
        let sockpath = if self.config.zdr.group.is_empty() {
            self.app_cache_dir.join("zdr.sock")
        } else {
            self.rspdir
                .join("cache")
                .join(format!("zdr.{}.sock", self.config.zdr.group))
        };

        let me = self.me.upgrade().expect("instance arc alive");
        Ok(Zdr::new(sockpath, me))
    }

    /// First signal: graceful shutdown. Second: force exit.
    pub fn install_signal_handler(&self) -> Result<()> {
        let me = self.me.clone();
        let hits = AtomicUsize::new(0);

        ctrlc::set_handler(move || {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                log!("rsp"; "shutting down (again to force)");
                if let Some(instance) = me.upgrade() {
                    std::thread::spawn(move || {
                        instance.shutdown();
                        if let Some(zdr) = instance.zdr.lock().take() {
                            zdr.close();
                        }
                    });
                }
            } else {
                std::process::exit(1);
            }
        })
        .map_err(|e| RspError::Other(format!("failed to set signal handler: {e}")))
    }
}

impl Handoff for Instance {
    fn detach_listeners(&self) -> Result<Vec<(i32, String)>> {
        self.servers.detach_all()
    }

    fn shutdown(&self) -> Result<()> {
        Instance::shutdown(self);
        Ok(())
    }
}

fn init_servlets(config: &Config, app_cache_dir: &PathBuf) -> Result<Arc<ServletCache>> {
    // make sure the compiler is available before anything builds
    let tool = Arc::new(RustTool::init(config.toolchain.libpath.clone())?);

    // the build dir is namespaced by toolchain so artifacts never load
    // into a host built with a different compiler
    let builddir = app_cache_dir
        .join(format!("build.{}", tool.version_tag()))
        .join("servlet");

    // when not recycling servlet libs, trash any old ones
    let ServletConfig { recycle, hot_reload, .. } = config.servlet;
    if !recycle {
        let _ = std::fs::remove_dir_all(&builddir);
    }
    std::fs::create_dir_all(&builddir)?;

    Ok(Arc::new(ServletCache::new(
        config.pub_dir.clone(),
        builddir,
        tool,
        hot_reload,
    )))
}
