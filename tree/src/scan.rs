//! The recursive tree scanner and the identity counter.

use std::collections::{hash_map, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::entry::{Entry, Source};
use crate::rules::RuleSet;
use crate::Error;

/// Issues entry identities: unique for the process lifetime.
///
/// The counter is seeded from the wall clock shifted left by 10 bits, so the
/// low bits are free for in-process increments and a restarted server is
/// extremely unlikely to reissue a number a client still has cached as an
/// entity tag.
#[derive(Debug)]
pub(crate) struct IdGen(AtomicU64);

impl IdGen {
    pub(crate) fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        IdGen(AtomicU64::new(seed << 10))
    }

    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Scans `dir` recursively into a fresh child mapping.
///
/// Identities from `old` are reused for entries whose modification time and
/// directory-ness are unchanged. Any OS error aborts the whole scan; the
/// caller decides whether to keep the previous snapshot.
pub(crate) fn scan_dir(
    dir: &Path,
    old: &HashMap<String, Arc<Entry>>,
    rules: &RuleSet,
    ids: &IdGen,
) -> Result<HashMap<String, Arc<Entry>>, Error> {
    debug!(dir = %dir.display(), "scanning");
    let listing = std::fs::read_dir(dir).map_err(|e| Error::ListDir(dir.to_path_buf(), e))?;

    let empty = HashMap::new();
    let mut cur: HashMap<String, Arc<Entry>> = HashMap::new();
    let mut aliases: Vec<(String, Entry)> = Vec::new();

    for dent in listing {
        let dent = dent.map_err(|e| Error::ListDir(dir.to_path_buf(), e))?;
        let path = dent.path();
        let meta = dent.metadata().map_err(|e| Error::Stat(path.clone(), e))?;
        let name = dent.file_name().to_string_lossy().into_owned();
        let is_dir = meta.is_dir();
        let mtime = meta.modified().map_err(|e| Error::Stat(path.clone(), e))?;

        let rule = rules.lookup(&name);

        let id = match old.get(&name) {
            Some(o) if o.mtime == mtime && o.is_dir == is_dir => {
                debug!(name = %name, id = o.id, "unchanged");
                o.id
            }
            _ => {
                let id = ids.next();
                debug!(name = %name, id, "new or changed");
                id
            }
        };

        let mut entry = Entry {
            name: name.clone(),
            size: meta.len(),
            mode: meta.permissions().mode(),
            mtime,
            is_dir,
            id,
            children: HashMap::new(),
            gzip: false,
            source: Source::Disk(path.clone()),
        };

        // Aliases are staged before the hide check: hiding a file does not
        // hide an alias derived from it.
        if !is_dir {
            if let Some(alias) = rule.alias_for(&name) {
                let mut aliased = entry.clone();
                aliased.gzip = true;
                aliases.push((alias, aliased));
            }
        }

        if rule.hides() {
            debug!(name = %name, "hidden");
            continue;
        }

        if is_dir {
            let old_children = old
                .get(&name)
                .filter(|o| o.is_dir)
                .map(|o| &o.children)
                .unwrap_or(&empty);
            entry.children = scan_dir(&path, old_children, rules, ids)?;
        }

        cur.insert(name, Arc::new(entry));
    }

    // Placed after the ordinary entries so a real file always wins a name
    // collision against a synthesized alias.
    for (alias, entry) in aliases {
        match cur.entry(alias) {
            hash_map::Entry::Occupied(slot) => {
                debug!(alias = %slot.key(), target = %entry.name, "gzip alias conflicts with existing entry, dropped");
            }
            hash_map::Entry::Vacant(slot) => {
                debug!(alias = %slot.key(), target = %entry.name, "gzip alias");
                slot.insert(Arc::new(entry));
            }
        }
    }

    Ok(cur)
}
