use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use tokio::{runtime::Handle, sync::oneshot};

use crate::error::{SCHEDULER, TransportError, map_io_error};

struct Worker {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
}

/// 固定数量的单线程 I/O 调度器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 每条连接的接收、分发与发送都在同一个调度器上运行，连接内的回调天然串行，
///   不同连接之间按调度器分摊；
/// - 调度器在服务启动时一次性创建，接入循环只做轮询选择。
///
/// ## 逻辑（How）
/// - 每个调度器是一个 `current_thread` Tokio 运行时，由专属线程 `block_on` 驱动，
///   直到收到停止信号；
/// - [`IoSchedulerGroup::next`] 以原子计数器轮询返回运行时句柄。
///
/// ## 契约（What）
/// - 丢弃调度器组会通知所有线程退出，仍在运行的任务随运行时一起被取消；
/// - 线程名形如 `ripple-io-0`，便于在日志与调试器中定位。
pub struct IoSchedulerGroup {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl IoSchedulerGroup {
    pub fn new(count: usize) -> Result<Self, TransportError> {
        let mut workers = Vec::with_capacity(count.max(1));
        for index in 0..count.max(1) {
            workers.push(spawn_worker(index)?);
        }
        tracing::debug!(schedulers = workers.len(), "io schedulers started");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// 轮询选出下一个调度器。
    pub fn next(&self) -> Handle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].handle.clone()
    }
}

fn spawn_worker(index: usize) -> Result<Worker, TransportError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| map_io_error(SCHEDULER, err))?;
    let handle = runtime.handle().clone();
    let (stop, stopped) = oneshot::channel::<()>();
    thread::Builder::new()
        .name(format!("ripple-io-{index}"))
        .spawn(move || {
            // 发送端被丢弃同样视为停止信号。
            let _ = runtime.block_on(stopped);
        })
        .map_err(|err| map_io_error(SCHEDULER, err))?;
    Ok(Worker {
        handle,
        stop: Some(stop),
    })
}

impl Drop for IoSchedulerGroup {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            if let Some(stop) = worker.stop.take() {
                let _ = stop.send(());
            }
        }
    }
}

impl fmt::Debug for IoSchedulerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSchedulerGroup")
            .field("schedulers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::mpsc};

    #[test]
    fn round_robin_spreads_work_across_threads() {
        let group = IoSchedulerGroup::new(3).expect("创建调度器");
        let (tx, rx) = mpsc::channel();
        for _ in 0..6 {
            let tx = tx.clone();
            group.next().spawn(async move {
                let name = thread::current().name().map(str::to_owned);
                let _ = tx.send(name);
            });
        }
        drop(tx);
        let names: HashSet<_> = rx.iter().flatten().collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|name| name.starts_with("ripple-io-")));
    }
}
