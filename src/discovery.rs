use crate::connection::Connection;
use crate::errors::*;
use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState};
use sysinfo::{Pid, ProcessesToUpdate, System};

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

/// Source of the game's live connections.
pub trait ConnectionSource: Send + Sync {
    fn discover(&self) -> Result<HashSet<Connection>>;
}

/// Which sockets count as game connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFilter {
    /// Substring of the process name, e.g. `PathOfExile` matches the
    /// steam and standalone clients alike.
    pub process_name: String,
    pub remote_port: u16,
}

impl ConnectionFilter {
    #[inline]
    pub fn matches_process(&self, name: &str) -> bool {
        name.contains(&self.process_name)
    }

    #[inline]
    pub fn matches_connection(&self, conn: &Connection) -> bool {
        conn.remote_port() == self.remote_port
    }
}

/// Maps `::ffff:a.b.c.d` back to plain ipv4, dual stack sockets report
/// their ipv4 peers that way.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(IpAddr::V4(ip), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Process names by pid, tagged with the start time they were read at.
#[derive(Debug, Default)]
struct ProcessNames {
    known: HashMap<u32, (u64, String)>,
}

impl ProcessNames {
    /// Cached name of `pid`, read again through `lookup` if the pid now
    /// belongs to a process with a different start time.
    fn resolve<F>(&mut self, pid: u32, start_time: u64, lookup: F) -> &str
    where
        F: FnOnce() -> String,
    {
        let stale = self.known.get(&pid).map_or(true, |(started, _)| *started != start_time);
        if stale {
            let name = lookup();
            trace!("pid {} is {} (started {})", pid, name, start_time);
            self.known.insert(pid, (start_time, name));
        }
        &self.known[&pid].1
    }

    fn forget(&mut self, pid: u32) {
        self.known.remove(&pid);
    }
}

struct ProcessTable {
    system: System,
    names: ProcessNames,
}

/// Established tcp sockets of the target process, read from the os tables.
pub struct ProcessConnections {
    filter: ConnectionFilter,
    table: Mutex<ProcessTable>,
}

impl ProcessConnections {
    pub fn new(filter: ConnectionFilter) -> ProcessConnections {
        ProcessConnections {
            filter,
            table: Mutex::new(ProcessTable {
                system: System::new(),
                names: ProcessNames::default(),
            }),
        }
    }

    /// Pids among `pids` that belong to the game process.
    fn game_pids(&self, pids: &HashSet<u32>) -> HashSet<u32> {
        let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ProcessTable { system, names } = &mut *table;

        let wanted = pids.iter().map(|pid| Pid::from_u32(*pid)).collect::<Vec<_>>();
        system.refresh_processes(ProcessesToUpdate::Some(&wanted), true);

        let mut game = HashSet::new();
        for pid in pids {
            match system.process(Pid::from_u32(*pid)) {
                Some(process) => {
                    let name = names.resolve(*pid, process.start_time(), || {
                        process.name().to_string_lossy().into_owned()
                    });
                    if self.filter.matches_process(name) {
                        game.insert(*pid);
                    }
                }
                None => names.forget(*pid),
            }
        }
        game
    }
}

impl ConnectionSource for ProcessConnections {
    fn discover(&self) -> Result<HashSet<Connection>> {
        let sockets = get_sockets_info(
            AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6,
            ProtocolFlags::TCP,
        )
        .map_err(|e| Error::Discovery(e.to_string()))?;

        let candidates = sockets
            .into_iter()
            .filter_map(|socket| match socket.protocol_socket_info {
                ProtocolSocketInfo::Tcp(tcp)
                    if tcp.state == TcpState::Established && tcp.remote_port == self.filter.remote_port =>
                {
                    Some((tcp, socket.associated_pids))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }

        let pids = candidates.iter().flat_map(|(_, pids)| pids.iter().copied()).collect();
        let game = self.game_pids(&pids);

        let mut connections = HashSet::new();
        for (tcp, pids) in candidates {
            if let Some(pid) = pids.into_iter().find(|pid| game.contains(pid)) {
                let conn = Connection::new(
                    pid,
                    canonical((tcp.local_addr, tcp.local_port).into()),
                    canonical((tcp.remote_addr, tcp.remote_port).into()),
                );
                trace!("discovered {} (pid {})", conn, pid);
                connections.insert(conn);
            }
        }

        Ok(connections)
    }
}
