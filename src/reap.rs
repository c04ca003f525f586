/*!
Collecting the exit status of finished gateway programs without waiting on
them.
*/
use tokio::process::Child;

/// Children whose output is done but whose exit hasn't been observed.
#[derive(Debug, Default)]
pub struct Reaper {
    children: Vec<Child>,
}

impl Reaper {
    pub fn new() -> Reaper {
        Reaper::default()
    }

    pub fn adopt(&mut self, child: Child) {
        self.children.push(child);
    }

    /// Check each child once, never blocking. Returns how many were collected.
    pub fn reap(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("child {:?} exited: {}", child.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::error!("Error checking on child {:?}: {}", child.id(), &e);
                false
            }
        });
        before - self.children.len()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.reap();
        if !self.children.is_empty() {
            log::debug!(
                "{} children still running; leaving them to the runtime.",
                self.children.len()
            );
        }
    }
}
