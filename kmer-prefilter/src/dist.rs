//! 多进程协作的最小通信接口。
//!
//! 每个 rank 处理静态分配的连续分片区间，写出 rank 本地结果；rank 0 收集
//! 各 rank 的状态（失败、无结果、有结果），再把整体结论广播给所有 rank。
//! 任一 rank 失败则所有 rank 中止；否则 rank 0 合并有结果的文件。
//! 单进程运行使用 [`LocalCommunicator`]；[`ChannelCommunicator`] 在一个进程内
//! 用线程模拟多个 rank。

use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// What a rank has to report at the result gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankStatus {
    /// The rank hit an error before the gather.
    Failed,
    /// Finished without a result file.
    Empty,
    /// Finished and wrote its rank-local result file.
    Ready,
}

impl RankStatus {
    /// Outcome of the whole run: any failure aborts it, otherwise one result suffices.
    pub fn combine(all: &[RankStatus]) -> RankStatus {
        if all.contains(&RankStatus::Failed) {
            RankStatus::Failed
        } else if all.contains(&RankStatus::Ready) {
            RankStatus::Ready
        } else {
            RankStatus::Empty
        }
    }
}

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Collect one status per rank at the root. The root gets the statuses indexed by rank,
    /// every other rank gets `None`.
    fn gather_status(&self, status: RankStatus) -> Result<Option<Vec<RankStatus>>>;

    /// Send the root's `status` to every rank; all ranks return it. The value passed by
    /// non-root ranks is ignored.
    fn broadcast_status(&self, status: RankStatus) -> Result<RankStatus>;
}

/// The only process of a single-process run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather_status(&self, status: RankStatus) -> Result<Option<Vec<RankStatus>>> {
        Ok(Some(vec![status]))
    }

    fn broadcast_status(&self, status: RankStatus) -> Result<RankStatus> {
        Ok(status)
    }
}

/// 一组以 channel 相连的 rank，每个线程持有其中一个。
///
/// root 不持有发往自己的 sender，其余 rank 上报一次后即释放自己的 sender：
/// 某个 rank 未上报就退出时，root 的接收端返回断开错误，而不是一直阻塞。
/// 因此每组端点只支持一次 gather。
pub struct ChannelCommunicator {
    rank: usize,
    size: usize,
    to_root: Mutex<Option<Sender<(usize, RankStatus)>>>,
    at_root: Option<Receiver<(usize, RankStatus)>>,
    to_ranks: Vec<Sender<RankStatus>>,
    from_root: Receiver<RankStatus>,
}

impl ChannelCommunicator {
    /// `size` connected endpoints, endpoint `i` has rank `i`.
    pub fn group(size: usize) -> Vec<ChannelCommunicator> {
        let size = size.max(1);
        let (to_root, at_root) = unbounded();
        let (to_ranks, from_root): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let mut group: Vec<ChannelCommunicator> = from_root
            .into_iter()
            .enumerate()
            .map(|(rank, from_root)| ChannelCommunicator {
                rank,
                size,
                to_root: Mutex::new((rank > 0).then(|| to_root.clone())),
                at_root: None,
                to_ranks: Vec::new(),
                from_root,
            })
            .collect();
        group[0].at_root = Some(at_root);
        group[0].to_ranks = to_ranks;
        group
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gather_status(&self, status: RankStatus) -> Result<Option<Vec<RankStatus>>> {
        let Some(rx) = &self.at_root else {
            let tx = self
                .to_root
                .lock()
                .map_err(|_| anyhow!("rank {}: endpoint poisoned", self.rank))?
                .take()
                .ok_or_else(|| anyhow!("rank {}: status already reported", self.rank))?;
            tx.send((self.rank, status)).map_err(|_| anyhow!("rank {}: root is gone", self.rank))?;
            return Ok(None);
        };
        let mut all = vec![RankStatus::Failed; self.size];
        all[0] = status;
        let mut reported = vec![false; self.size];
        reported[0] = true;
        for _ in 1..self.size {
            let (rank, s) = rx.recv().map_err(|_| {
                let missing: Vec<usize> = (0..self.size).filter(|&r| !reported[r]).collect();
                anyhow!("rank(s) {:?} exited before reporting their status", missing)
            })?;
            if rank == 0 || rank >= self.size || reported[rank] {
                bail!("unexpected report from rank {}", rank);
            }
            reported[rank] = true;
            all[rank] = s;
        }
        Ok(Some(all))
    }

    fn broadcast_status(&self, status: RankStatus) -> Result<RankStatus> {
        if self.is_root() {
            // a rank that already returned may have dropped its endpoint
            for tx in self.to_ranks.iter().skip(1) {
                let _ = tx.send(status);
            }
            return Ok(status);
        }
        self.from_root.recv().map_err(|_| anyhow!("rank {}: root is gone", self.rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_is_its_own_root() {
        let c = LocalCommunicator;
        assert!(c.is_root());
        assert_eq!(c.gather_status(RankStatus::Ready).unwrap(), Some(vec![RankStatus::Ready]));
        assert_eq!(c.broadcast_status(RankStatus::Empty).unwrap(), RankStatus::Empty);
    }

    #[test]
    fn combined_status() {
        use RankStatus::*;
        assert_eq!(RankStatus::combine(&[Empty, Ready, Empty]), Ready);
        assert_eq!(RankStatus::combine(&[Empty, Empty]), Empty);
        assert_eq!(RankStatus::combine(&[Ready, Failed, Ready]), Failed);
    }

    #[test]
    fn channel_group_gathers_at_root() {
        let comms = ChannelCommunicator::group(4);
        let results: Vec<(Option<Vec<RankStatus>>, RankStatus)> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    s.spawn(move || {
                        let mine = if c.rank() % 2 == 1 { RankStatus::Ready } else { RankStatus::Empty };
                        let gathered = c.gather_status(mine).unwrap();
                        let overall = gathered.as_deref().map_or(mine, RankStatus::combine);
                        (gathered, c.broadcast_status(overall).unwrap())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        use RankStatus::*;
        assert_eq!(results[0].0, Some(vec![Empty, Ready, Empty, Ready]));
        assert!(results[1..].iter().all(|(g, _)| g.is_none()));
        assert!(results.iter().all(|(_, s)| *s == Ready));
    }

    #[test]
    fn dropped_rank_disconnects_the_root() {
        let mut comms = ChannelCommunicator::group(3);
        let lost = comms.pop().unwrap();
        let reporter = comms.pop().unwrap();
        let root = comms.pop().unwrap();
        drop(lost);
        reporter.gather_status(RankStatus::Ready).unwrap();
        let err = root.gather_status(RankStatus::Empty).unwrap_err();
        assert!(err.to_string().contains("[2]"), "{}", err);

        // the reporting rank is still released
        root.broadcast_status(RankStatus::Failed).unwrap();
        assert_eq!(reporter.broadcast_status(RankStatus::Ready).unwrap(), RankStatus::Failed);
    }

    #[test]
    fn dropped_root_releases_waiting_ranks() {
        let mut comms = ChannelCommunicator::group(2);
        let rank1 = comms.pop().unwrap();
        drop(comms);
        assert!(rank1.broadcast_status(RankStatus::Empty).is_err());
    }
}
