use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use async_trait::async_trait;

use super::{Event, Watcher};
use crate::config::Config;
use crate::discoverer::EventSource;
use crate::scrape::ScrapeConfig;
use crate::shutdown::ShutdownSignal;

mod inotify {
    use std::ffi::{CString, c_void};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};

    use futures::Stream;
    use tokio::io::unix::AsyncFd;

    const BUFFER_SIZE: usize = 4096;

    pub struct Watcher {
        fd: AsyncFd<OwnedFd>,
        // watch descriptors, not file descriptors. The kernel tears them
        // down with the inotify fd, they must never be close()d.
        watches: Vec<i32>,
    }

    impl Watcher {
        pub fn new() -> io::Result<Watcher> {
            let fd = unsafe {
                let ret = libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK);
                if ret == -1 {
                    return Err(io::Error::last_os_error());
                }

                OwnedFd::from_raw_fd(ret)
            };

            Ok(Watcher {
                fd: AsyncFd::new(fd)?,
                watches: vec![],
            })
        }

        pub fn add(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
            let path = CString::new(path.as_ref().as_os_str().as_bytes())?;

            let wd = unsafe {
                let ret = libc::inotify_add_watch(
                    self.fd.as_raw_fd(),
                    path.as_ptr() as *const _,
                    libc::IN_CLOSE_WRITE | libc::IN_MOVE | libc::IN_MOVED_TO | libc::IN_CREATE,
                );
                if ret == -1 {
                    return Err(io::Error::last_os_error());
                }

                ret
            };

            self.watches.push(wd);

            Ok(())
        }

        pub fn into_stream(self) -> ChangeStream {
            ChangeStream {
                fd: self.fd,
                buf: Box::new([0u8; BUFFER_SIZE]),
            }
        }
    }

    /// Yields once per inotify read. The events themselves carry nothing
    /// the caller needs, any wakeup means "the watched paths changed".
    pub struct ChangeStream {
        fd: AsyncFd<OwnedFd>,
        buf: Box<[u8; BUFFER_SIZE]>,
    }

    impl Stream for ChangeStream {
        type Item = io::Result<()>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let this = self.get_mut();

            loop {
                let mut guard = ready!(this.fd.poll_read_ready(cx))?;

                match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            this.buf.as_mut_ptr() as *mut c_void,
                            this.buf.len(),
                        )
                    };
                    if ret == -1 {
                        return Err(io::Error::last_os_error());
                    }

                    Ok(ret as usize)
                }) {
                    Ok(Ok(_len)) => return Poll::Ready(Some(Ok(()))),
                    Ok(Err(err)) => return Poll::Ready(Some(Err(err))),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use futures::StreamExt;
        use std::fs::File;
        use std::io::Write;

        #[tokio::test]
        async fn write_is_detected() {
            let directory = tempfile::tempdir().unwrap();
            let filepath = directory.path().join("test.txt");
            let mut file = File::create(&filepath).unwrap();

            let mut watcher = Watcher::new().unwrap();
            watcher.add(directory.path()).unwrap();
            let mut stream = watcher.into_stream();

            file.write_all(&[0]).unwrap();
            file.sync_all().unwrap();
            drop(file);

            match stream.next().await {
                Some(Ok(())) => {}
                other => panic!("change should be detected, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn dropping_a_watcher_leaves_other_descriptors_alone() {
            let directory = tempfile::tempdir().unwrap();

            // the first watcher's low numbered watch descriptors must not be
            // close()d as file descriptors when it is dropped
            let mut first = Watcher::new().unwrap();
            first.add(directory.path()).unwrap();
            let mut second = Watcher::new().unwrap();
            second.add(directory.path()).unwrap();
            drop(first);

            let mut stream = second.into_stream();
            let filepath = directory.path().join("test.txt");
            let mut file = File::create(&filepath).unwrap();
            file.write_all(&[0]).unwrap();
            file.sync_all().unwrap();
            drop(file);

            match stream.next().await {
                Some(Ok(())) => {}
                other => panic!("change should be detected, got {other:?}"),
            }
        }
    }
}

// Editors and configmap mounts tend to write files in several steps, a
// short delay folds those into one reload.
const DEBOUNCE_DELAY: Duration = Duration::from_secs(1);
const RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Watches the service's own config file and emits an [`Event`] whenever it
/// changes on disk.
pub struct FileWatcher {
    path: PathBuf,
}

impl FileWatcher {
    pub fn new(path: PathBuf) -> Self {
        FileWatcher { path }
    }

    fn build_watcher(&self) -> Result<inotify::Watcher, crate::Error> {
        let mut watcher = inotify::Watcher::new()?;
        watcher.add(&self.path)?;
        // file replacement (rename over) only shows up on the directory
        if let Some(parent) = self.path.parent() {
            watcher.add(parent)?;
        }

        Ok(watcher)
    }
}

#[async_trait]
impl Watcher for FileWatcher {
    fn load(&self) -> Result<Vec<ScrapeConfig>, crate::config::Error> {
        Config::load(&self.path).map(|config| config.scrape_configs())
    }

    async fn watch(
        &self,
        tx: mpsc::Sender<Event>,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), crate::Error> {
        let mut stream = self.build_watcher()?.into_stream();
        info!(message = "watching configuration file", path = ?self.path);

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                result = stream.next() => match result {
                    Some(result) => result,
                    None => return Ok(()),
                },
            };

            match result {
                Ok(()) => {
                    tokio::time::sleep(DEBOUNCE_DELAY).await;

                    info!(message = "configuration file changed", path = ?self.path);
                    if tx
                        .send(Event {
                            source: EventSource::ConfigFile,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(err) => {
                    error!(message = "reading inotify failed, retrying watch", %err);

                    tokio::time::sleep(RETRY_TIMEOUT).await;
                    stream = self.build_watcher()?.into_stream();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_update_emits_event() {
        let directory = tempfile::tempdir().unwrap();
        let filepath = directory.path().join("divvy.yaml");
        let mut file = std::fs::File::create(&filepath).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let (_trigger, shutdown) = crate::shutdown::channel();
        let watcher = FileWatcher::new(filepath.clone());
        let handle = tokio::spawn(async move { watcher.watch(tx, shutdown).await });

        file.write_all(b"config: {}\n").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("change should be detected")
            .unwrap();
        assert_eq!(event.source, EventSource::ConfigFile);

        handle.abort();
    }
}
