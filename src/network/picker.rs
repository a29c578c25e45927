use crate::network::registry::ClientInfo;

/// Chooses which client receives the next unit of work
pub trait ClientPicker: Send + Sync {
    fn pick<'a>(&self, clients: &mut dyn Iterator<Item = &'a ClientInfo>) -> Option<&'a ClientInfo>;
}

fn is_idle(client: &ClientInfo) -> bool {
    client.online && client.active && client.assigned_url.is_none()
}

/// First online, active client with nothing assigned
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstIdlePicker;

impl ClientPicker for FirstIdlePicker {
    fn pick<'a>(&self, clients: &mut dyn Iterator<Item = &'a ClientInfo>) -> Option<&'a ClientInfo> {
        <&mut dyn Iterator<Item = &'a ClientInfo> as Iterator>::find(&mut &mut *clients, |client| is_idle(client))
    }
}

/// Idle client that has been handed the least work so far
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedPicker;

impl ClientPicker for LeastLoadedPicker {
    fn pick<'a>(&self, clients: &mut dyn Iterator<Item = &'a ClientInfo>) -> Option<&'a ClientInfo> {
        clients.filter(|client| is_idle(client)).min_by_key(|client| client.work_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str, online: bool, assigned: Option<&str>, work_count: u64) -> ClientInfo {
        ClientInfo {
            online,
            assigned_url: assigned.map(str::to_string),
            work_count,
            ..ClientInfo::new(id, "127.0.0.1:1")
        }
    }

    #[test]
    fn first_idle_skips_busy_and_offline_clients() {
        let clients = vec![
            client("offline", false, None, 0),
            client("busy", true, Some("https://example.com/"), 0),
            client("idle", true, None, 5),
            client("idle2", true, None, 0),
        ];

        let chosen = FirstIdlePicker.pick(&mut clients.iter());
        assert_eq!(chosen.map(|c| c.id.as_str()), Some("idle"));
    }

    #[test]
    fn inactive_clients_are_never_picked() {
        let mut paused = client("paused", true, None, 0);
        paused.active = false;
        let clients = vec![paused];

        assert!(FirstIdlePicker.pick(&mut clients.iter()).is_none());
        assert!(LeastLoadedPicker.pick(&mut clients.iter()).is_none());
    }

    #[test]
    fn least_loaded_prefers_lower_work_count() {
        let clients = vec![
            client("a", true, None, 5),
            client("b", true, None, 1),
            client("c", true, Some("https://example.com/"), 0),
        ];

        let chosen = LeastLoadedPicker.pick(&mut clients.iter());
        assert_eq!(chosen.map(|c| c.id.as_str()), Some("b"));
    }

    #[test]
    fn no_clients_means_no_pick() {
        let clients: Vec<ClientInfo> = Vec::new();
        assert!(FirstIdlePicker.pick(&mut clients.iter()).is_none());
    }
}
