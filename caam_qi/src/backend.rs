//! Backend handle: init, shutdown and the state shared by all contexts.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use qman::{
    AffinityGuard, CgrHandler, CgrId, CpuSet, DmaMapper, DqrrOrigin, FqHandler, Fqid, QueueManager,
};

use crate::affinity::{PcpuPriv, PcpuTable};
use crate::cache::QiCache;
use crate::config::QiConfig;
use crate::congestion::{self, CongestionMonitor};
use crate::context::DrvCtx;
use crate::desc::SharedDesc;
use crate::dispatch::{InflightTable, ReqFqHandler, RspFqHandler};
use crate::error::{Error, Result};
use crate::fq::FqManager;
use crate::napi::{DispatchWorker, Napi};

/// Queue-interface backend.
///
/// Owns the shared congestion group, one response queue and poll context
/// per portal CPU, the in-flight request table and the scratch buffer pool.
/// Contexts keep the backend alive through an `Arc`.
pub struct QiBackend {
    pub(crate) qman: Arc<dyn QueueManager>,
    pub(crate) dma: Arc<dyn DmaMapper>,
    pub(crate) cfg: QiConfig,
    pub(crate) cgrid: CgrId,
    pub(crate) pcpu: PcpuTable,
    pub(crate) inflight: Arc<InflightTable>,
    req_handler: Arc<ReqFqHandler>,
    congestion: Arc<CongestionMonitor>,
    cache: QiCache,
    /// CPU init ran on; the congestion group must be deleted from there.
    init_cpu: usize,
    workers: Mutex<Vec<DispatchWorker>>,
    shut_down: AtomicBool,
}

impl QiBackend {
    /// Bring the backend up.
    ///
    /// Runs pinned to the first portal CPU, which also performs shutdown.
    /// Creates the congestion group, a response queue and poll context per
    /// portal CPU, and, if configured, the dispatch workers. Everything
    /// created before a failure is torn down again.
    pub fn init(
        qman: Arc<dyn QueueManager>,
        dma: Arc<dyn DmaMapper>,
        cfg: QiConfig,
    ) -> Result<Arc<Self>> {
        let cpus = qman.affine_cpus();
        let Some(init_cpu) = cpus.first() else {
            tracing::error!("no portal-owning CPU");
            return Err(Error::NoAffinePortals);
        };
        let _pin = AffinityGuard::pin(init_cpu);

        let congestion = Arc::new(CongestionMonitor::new());
        let cgrid = init_cgr(&*qman, &cpus, &cfg, &congestion)?;

        let inflight = Arc::new(InflightTable::new(Arc::clone(&dma)));
        let pcpu = match alloc_rsp_fqs(&*qman, &cfg, &cpus, cgrid, &inflight) {
            Ok(pcpu) => pcpu,
            Err(e) => {
                tracing::error!(error = %e, "can't allocate CAAM response FQs");
                destroy_cgr(&*qman, cgrid);
                return Err(e);
            }
        };

        let mut workers = Vec::new();
        if cfg.spawn_workers {
            for (cpu, p) in pcpu.iter() {
                let spawned =
                    DispatchWorker::spawn(Arc::clone(&p.napi), Arc::clone(&qman), cfg.napi_weight);
                match spawned {
                    Ok(w) => workers.push(w),
                    Err(source) => {
                        tracing::error!(cpu, error = %source, "can't start dispatch worker");
                        drop(workers);
                        free_rsp_fqs(&FqManager::new(&*qman, &cfg), &pcpu);
                        destroy_cgr(&*qman, cgrid);
                        return Err(Error::ResourceExhausted {
                            what: "dispatch worker",
                            source,
                        });
                    }
                }
            }
        }

        let cache = QiCache::new(cfg.cache_obj_size, cfg.cache_prealloc, cfg.cache_max_free);
        let req_handler = Arc::new(ReqFqHandler::new(Arc::clone(&inflight)));

        tracing::info!(cpus = cpus.weight(), %cgrid, "CAAM queue interface initialised");
        Ok(Arc::new(Self {
            qman,
            dma,
            cfg,
            cgrid,
            pcpu,
            inflight,
            req_handler,
            congestion,
            cache,
            init_cpu,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Tear the backend down. Later calls do nothing and return `Ok(())`.
    ///
    /// Stops the workers, disables every poll context, kills the response
    /// queues (completing whatever they still hold) and deletes the
    /// congestion group from the init CPU. Only the congestion group
    /// deletion is reported; queue kill failures are logged.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        drop(workers);

        for (_, p) in self.pcpu.iter() {
            p.napi.disable();
        }
        free_rsp_fqs(&self.fqs(), &self.pcpu);

        let _pin = AffinityGuard::pin(self.init_cpu);
        let ret = self.qman.delete_cgr(self.cgrid);
        match &ret {
            Ok(()) => self.qman.release_cgrid(self.cgrid),
            Err(e) => tracing::error!(cgrid = %self.cgrid, error = %e, "deletion of CGR failed"),
        }
        tracing::info!("CAAM queue interface shut down");
        ret.map_err(Error::from)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Create a context for `desc` on `*cpu`. If that CPU owns no portal the
    /// context is placed on another one and `*cpu` is updated.
    pub fn create_context(
        self: &Arc<Self>,
        cpu: &mut usize,
        desc: &SharedDesc,
    ) -> Result<DrvCtx> {
        if self.is_shut_down() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "queue interface is shut down",
            )));
        }
        DrvCtx::new(self, cpu, desc)
    }

    /// Advisory congestion state of the shared backlog.
    pub fn is_congested(&self) -> bool {
        self.congestion.is_congested()
    }

    /// Number of times the backlog entered congestion.
    pub fn times_congested(&self) -> u64 {
        self.congestion.times_congested()
    }

    pub fn cache(&self) -> &QiCache {
        &self.cache
    }

    pub fn config(&self) -> &QiConfig {
        &self.cfg
    }

    pub fn cgrid(&self) -> CgrId {
        self.cgrid
    }

    pub fn affine_cpus(&self) -> &CpuSet {
        self.pcpu.cpus()
    }

    /// Response queue of `cpu`, if it owns a portal.
    pub fn rsp_fqid(&self, cpu: usize) -> Option<Fqid> {
        self.pcpu.rsp_fq(cpu)
    }

    pub fn init_cpu(&self) -> usize {
        self.init_cpu
    }

    /// Round-robin cursor for contexts placed off a non-portal CPU.
    pub fn last_cpu(&self) -> usize {
        self.pcpu.last_cpu()
    }

    /// Requests currently owned by the hardware.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Drive completions of `cpu` from the calling thread.
    ///
    /// Kicks the portal so pending responses schedule the poll context,
    /// then runs the context until it completes. Returns the number of
    /// completions handled.
    pub fn poll_cpu(&self, cpu: usize) -> usize {
        let Some(napi) = self.pcpu.napi(cpu) else {
            return 0;
        };
        if !napi.is_scheduled() {
            self.qman
                .poll_dqrr(cpu, self.cfg.napi_weight, DqrrOrigin::Process);
        }
        let mut cleaned = 0;
        while napi.is_scheduled() {
            let n = napi.poll(&*self.qman, self.cfg.napi_weight);
            if n == 0 {
                thread::yield_now();
            }
            cleaned += n;
        }
        cleaned
    }

    /// [`poll_cpu`](Self::poll_cpu) over every portal CPU.
    pub fn poll_all(&self) -> usize {
        self.pcpu.cpus().iter().map(|cpu| self.poll_cpu(cpu)).sum()
    }

    pub(crate) fn fqs(&self) -> FqManager<'_> {
        FqManager::new(&*self.qman, &self.cfg)
    }

    pub(crate) fn req_handler(&self) -> Arc<dyn FqHandler> {
        Arc::clone(&self.req_handler) as Arc<dyn FqHandler>
    }
}

impl Drop for QiBackend {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "QI shutdown on drop failed");
        }
    }
}

// =============================================================================
// Init Helpers
// =============================================================================

fn init_cgr(
    qman: &dyn QueueManager,
    cpus: &CpuSet,
    cfg: &QiConfig,
    monitor: &Arc<CongestionMonitor>,
) -> Result<CgrId> {
    let cgrid = qman.alloc_cgrid().map_err(|source| {
        tracing::error!(error = %source, "CGR alloc failed for rsp FQs");
        Error::ResourceExhausted {
            what: "congestion group id",
            source,
        }
    })?;

    let opts = congestion::cgr_options(cpus.weight(), cfg.backlog_per_cpu);
    let handler = Arc::clone(monitor) as Arc<dyn CgrHandler>;
    if let Err(e) = qman.create_cgr(cgrid, &opts, handler) {
        tracing::error!(%cgrid, error = %e, "error creating CAAM CGR");
        qman.release_cgrid(cgrid);
        return Err(e.into());
    }

    tracing::debug!(%cgrid, threshold = opts.cs_thres, "congestion threshold set");
    Ok(cgrid)
}

fn destroy_cgr(qman: &dyn QueueManager, cgrid: CgrId) {
    match qman.delete_cgr(cgrid) {
        Ok(()) => qman.release_cgrid(cgrid),
        Err(e) => tracing::error!(%cgrid, error = %e, "deletion of CGR failed"),
    }
}

fn alloc_rsp_fqs(
    qman: &dyn QueueManager,
    cfg: &QiConfig,
    cpus: &CpuSet,
    cgrid: CgrId,
    inflight: &Arc<InflightTable>,
) -> Result<PcpuTable> {
    let fqs = FqManager::new(qman, cfg);
    let mut pcpu = PcpuTable::new(cpus.clone());
    for cpu in cpus.iter() {
        let napi = Arc::new(Napi::new(cpu));
        let handler = Arc::new(RspFqHandler::new(Arc::clone(&napi), Arc::clone(inflight)));
        match fqs.alloc_rsp_fq(cpu, handler, cgrid) {
            Ok(rsp_fq) => pcpu.insert(cpu, PcpuPriv { rsp_fq, napi }),
            Err(e) => {
                tracing::error!(cpu, error = %e, "CAAM rsp FQ alloc failed");
                free_rsp_fqs(&fqs, &pcpu);
                return Err(e);
            }
        }
    }
    Ok(pcpu)
}

fn free_rsp_fqs(fqs: &FqManager<'_>, pcpu: &PcpuTable) {
    for (cpu, p) in pcpu.iter() {
        if let Err(e) = fqs.kill_fq(p.rsp_fq, cpu) {
            tracing::error!(cpu, fqid = %p.rsp_fq, error = %e, "rsp FQ kill failed");
        }
    }
}
