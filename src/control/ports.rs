//! Listening ports of the current network namespace, read from procfs.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

const TCP_LISTEN: &str = "0A";
// Unconnected UDP sockets are reported as TCP_CLOSE.
const UDP_UNCONNECTED: &str = "07";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListeningPorts {
    pub tcp: Vec<u16>,
    pub udp: Vec<u16>,
}

/// Ports in `state` from the text of a `/proc/net/{tcp,udp}[6]` table.
pub fn parse_proc_net(text: &str, state: &str) -> BTreeSet<u16> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let st = fields.nth(1)?;
            if !st.eq_ignore_ascii_case(state) {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

fn read_table(root: &Path, name: &str, state: &str) -> BTreeSet<u16> {
    std::fs::read_to_string(root.join(name))
        .map(|text| parse_proc_net(&text, state))
        .unwrap_or_default()
}

/// Read the four tables under `root` (normally `/proc/net`). Missing tables
/// contribute nothing.
pub fn listening_ports(root: &Path) -> ListeningPorts {
    let mut tcp = read_table(root, "tcp", TCP_LISTEN);
    tcp.extend(read_table(root, "tcp6", TCP_LISTEN));
    let mut udp = read_table(root, "udp", UDP_UNCONNECTED);
    udp.extend(read_table(root, "udp6", UDP_UNCONNECTED));
    ListeningPorts {
        tcp: tcp.into_iter().collect(),
        udp: udp.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:A1B2 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 20 4 30 10 -1
   2: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 999 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn test_parse_listening_tcp() {
        let ports = parse_proc_net(TCP, TCP_LISTEN);
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![22, 8080]);
    }

    #[test]
    fn test_listening_ports_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tcp"), TCP).unwrap();
        std::fs::write(
            dir.path().join("udp6"),
            "  sl  local_address                         remote_address                        st\n   0: 00000000000000000000000000000000:14E9 00000000000000000000000000000000:0000 07\n",
        )
        .unwrap();

        let ports = listening_ports(dir.path());
        assert_eq!(ports.tcp, vec![22, 8080]);
        assert_eq!(ports.udp, vec![5353]);
    }
}
