//! Spool directory scanning
//!
//! Producers drop one file per event into the spool directory. A collection
//! pass reads every regular file in a single directory listing: the content
//! is the event message and the modification time is the event time.
//!
//! Events are ordered by timestamp. Files with the same timestamp keep the
//! order of the directory listing, which the filesystem does not guarantee
//! to be stable, so equal-time events may be sent in different orders across
//! retries.

use std::fs;
use std::path::{Path, PathBuf};

use crate::collector::Event;
use crate::config::UnreadablePolicy;
use crate::error::{Error, Result};

/// The spool directory
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

/// Result of one collection pass
#[derive(Debug, Default)]
pub struct Collection {
    /// Events ordered by timestamp
    pub events: Vec<Event>,
    /// Files whose content is in `events`
    pub files: Vec<PathBuf>,
    /// Files that were listed but could not be read
    pub unreadable: Vec<PathBuf>,
}

impl Collection {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Files to remove once the batch has been acknowledged
    pub fn files_to_delete(&self, policy: UnreadablePolicy) -> Vec<&Path> {
        let mut files: Vec<&Path> = self.files.iter().map(PathBuf::as_path).collect();
        if policy == UnreadablePolicy::Delete {
            files.extend(self.unreadable.iter().map(PathBuf::as_path));
        }
        files
    }
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List the directory and read every non-directory entry.
    ///
    /// Only a failure to list the directory itself is an error. Unreadable
    /// files are logged and reported in [`Collection::unreadable`].
    pub fn collect(&self) -> Result<Collection> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::fs(&self.dir, e))?;

        let mut collection = Collection::default();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "Unable to list entry");
                    continue;
                }
            };
            let path = entry.path();

            match read_event(&entry) {
                Ok(Some(event)) => {
                    collection.events.push(event);
                    collection.files.push(path);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Unable to read event");
                    collection.unreadable.push(path);
                }
            }
        }

        // Stable: equal timestamps keep listing order
        collection.events.sort_by_key(|event| event.timestamp);

        tracing::trace!(
            dir = %self.dir.display(),
            events = collection.events.len(),
            unreadable = collection.unreadable.len(),
            "Collected spool"
        );
        Ok(collection)
    }

    /// Remove acknowledged files, continuing past failures.
    ///
    /// Returns one error per file that could not be removed.
    pub fn remove(&self, files: &[&Path]) -> Vec<Error> {
        let mut failures = Vec::new();
        for path in files {
            if let Err(e) = fs::remove_file(path) {
                let err = Error::fs(*path, e);
                tracing::error!(error = %err, "Unable to delete event");
                failures.push(err);
            }
        }
        failures
    }
}

/// `None` for subdirectories, which are not events
fn read_event(entry: &fs::DirEntry) -> Result<Option<Event>> {
    let path = entry.path();
    let metadata = entry.metadata().map_err(|e| Error::fs(&path, e))?;
    if metadata.is_dir() {
        return Ok(None);
    }

    let modified = metadata.modified().map_err(|e| Error::fs(&path, e))?;
    let content = fs::read(&path).map_err(|e| Error::fs(&path, e))?;

    Ok(Some(Event::from_file_content(modified, &content)))
}
