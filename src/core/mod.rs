pub mod gpu;
pub mod protocol;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod task;

/// Generate a short opaque task id (first 8 hex chars of a v4 UUID).
pub fn short_task_id() -> String {
    let id = uuid::Uuid::new_v4().as_simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_task_id() {
        let id = short_task_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, short_task_id());
    }
}
