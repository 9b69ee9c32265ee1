//! One function per 9P2000.u request type (spec §4.6).
//!
//! Every handler's return path is strictly local: it either produces a
//! success `FCall` or an [`Error`] that [`Session::dispatch_frame`]
//! folds into an `Rerror` reply. Only [`Error::Fatal`] escapes to tear
//! the session down (spec §7).

use crate::error::{string, Error};
use crate::fcall::*;
use crate::fidtable::FidState;
use crate::session::{Session, SessionState};

/// I/O unit floor/ceiling the server advertises on `Topen`/`Tcreate`
/// (spec §4.6: "a fixed value ≥ 4096 and ≤ negotiated max minus header
/// slack"). `tversion` clamps the negotiated `msize` to at least
/// `MIN_NEGOTIATED_MSIZE` precisely so this floor is reachable — the
/// protocol-level minimum `msize` of 256 (spec §5) is too small to leave
/// room for a 4096-byte iounit above the header, so the two bounds are
/// irreconcilable below that point and the floor wins.
const IOUNIT_FLOOR: u32 = 4096;

/// Smallest `msize` `tversion` will negotiate, chosen so `iounit_for`
/// always clears `IOUNIT_FLOOR`. Below this, honoring the client's
/// requested `msize` would mean violating the iounit invariant instead.
const MIN_NEGOTIATED_MSIZE: u32 = IOUNIT_FLOOR + IOHDRSZ;

fn iounit_for(msize: u32) -> u32 {
    let ceiling = msize.saturating_sub(IOHDRSZ);
    IOUNIT_FLOOR.min(ceiling)
}

fn parent_and_name(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_owned(), trimmed[1..].to_owned()),
        Some(idx) => (trimmed[..idx].to_owned(), trimmed[idx + 1..].to_owned()),
        None => ("/".to_owned(), trimmed.to_owned()),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Dispatch a decoded request body to the matching handler.
pub async fn dispatch(session: &mut Session, req: FCall) -> Result<FCall, Error> {
    match req {
        FCall::TVersion { msize, version } => tversion(session, msize, version).await,
        FCall::TAuth { .. } => Err(Error::proto(string::AUTH_NOT_REQUIRED)),
        FCall::TAttach {
            fid,
            afid,
            uname,
            aname,
        } => tattach(session, fid, afid, uname, aname),
        FCall::TWalk {
            fid,
            newfid,
            wnames,
        } => twalk(session, fid, newfid, wnames).await,
        FCall::TOpen { fid, mode } => topen(session, fid, mode).await,
        FCall::TCreate {
            fid,
            name,
            perm,
            mode,
        } => tcreate(session, fid, name, perm, mode).await,
        FCall::TRead { fid, offset, count } => tread(session, fid, offset, count).await,
        FCall::TWrite { fid, offset, data } => twrite(session, fid, offset, data).await,
        FCall::TClunk { fid } => tclunk(session, fid).await,
        FCall::TRemove { fid } => tremove(session, fid).await,
        FCall::TStat { fid } => tstat(session, fid).await,
        FCall::TWStat { fid, stat } => twstat(session, fid, stat).await,
        FCall::TFlush { .. } => Ok(FCall::RFlush),
        other => Err(Error::proto(format!("unexpected request {:?}", MsgType::from(&other)))),
    }
}

async fn tversion(session: &mut Session, msize: u32, version: String) -> Result<FCall, Error> {
    let ceiling = session.limits.max_msize;
    // Below MIN_NEGOTIATED_MSIZE, a server configured with an even
    // smaller max_msize ceiling wins; see IOUNIT_FLOOR's doc comment.
    let floor = MIN_NEGOTIATED_MSIZE.min(ceiling);
    let clamped = msize.clamp(floor, ceiling);
    session.msize = clamped;
    session.reset_for_version().await;

    let reply_version = if version == P92000U || version == P92000 {
        version.clone()
    } else if version.starts_with("9P2000") {
        // degrade gracefully: any 9P2000-family string we don't
        // recognize negotiates down to plain 9P2000 (SPEC_FULL dual
        // acceptance note).
        P92000.to_owned()
    } else {
        VERSION_UNKNOWN.to_owned()
    };
    session.version = reply_version.clone();

    Ok(FCall::RVersion {
        msize: clamped,
        version: reply_version,
    })
}

fn tattach(
    session: &mut Session,
    fid: u32,
    _afid: u32,
    _uname: String,
    _aname: String,
) -> Result<FCall, Error> {
    let qid = QId::root();
    session
        .fids
        .insert(fid, FidState::new(0, qid, "/".to_owned()))?;
    session.attach();
    Ok(FCall::RAttach { qid })
}

async fn twalk(
    session: &mut Session,
    fid: u32,
    newfid: u32,
    wnames: Vec<String>,
) -> Result<FCall, Error> {
    if !matches!(session.state, SessionState::Attached) {
        return Err(Error::proto(string::NOT_ATTACHED));
    }
    let base = session
        .fids
        .get(fid)
        .cloned()
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?;

    if wnames.is_empty() {
        if newfid != fid {
            session.fids.insert(newfid, base)?;
        }
        return Ok(FCall::RWalk { wqids: vec![] });
    }

    // Resolve every component under a single lock acquisition so the walk
    // observes one consistent driver state, rather than one acquisition
    // per component (spec §4.2: batch() exists exactly for this).
    let base_path = base.path.clone();
    let names = wnames.clone();
    let resolved: Vec<(String, bool)> = session
        .gateway
        .batch(move |d| {
            let mut current_path = base_path;
            let mut results = Vec::with_capacity(names.len());
            for name in &names {
                let candidate = if name == "." {
                    current_path.clone()
                } else if name == ".." {
                    let (parent, _) = parent_and_name(&current_path);
                    parent
                } else {
                    join(&current_path, name)
                };
                match crate::storage::stat_locked(d, &candidate) {
                    Ok(meta) => {
                        current_path = candidate;
                        results.push((current_path.clone(), meta.is_dir));
                    }
                    Err(_) => break,
                }
            }
            Ok(results)
        })
        .await?;

    let mut current_path = base.path.clone();
    let mut current_qid = base.qid;
    let mut wqids = Vec::with_capacity(resolved.len());
    for (path, is_dir) in resolved {
        let qid = QId {
            typ: if is_dir { QIdType::DIR } else { QIdType::FILE },
            version: 0,
            path: session.fids.next_qid_path(),
        };
        current_path = path;
        current_qid = qid;
        wqids.push(qid);
    }

    if wqids.len() < wnames.len() {
        // First (or later) component failed: the walked prefix is
        // reported, nothing is allocated (spec §8 scenario S5).
        return Ok(FCall::RWalk { wqids });
    }

    let new_state = FidState::new(0, current_qid, current_path);
    if newfid == fid {
        if let Some(slot) = session.fids.get_mut(fid) {
            *slot = new_state;
        }
    } else {
        session.fids.insert(newfid, new_state)?;
    }
    Ok(FCall::RWalk { wqids })
}

async fn topen(session: &mut Session, fid: u32, mode: u8) -> Result<FCall, Error> {
    let state = session
        .fids
        .get(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?
        .clone();
    if state.opened {
        return Err(Error::proto(string::ALREADY_OPEN));
    }
    let _ = mode;
    let handle = session.gateway.open(&state.path).await?;
    let qid = state.qid;
    if let Some(slot) = session.fids.get_mut(fid) {
        slot.handle = handle;
        slot.opened = true;
    }
    Ok(FCall::ROpen {
        qid,
        iounit: iounit_for(session.msize),
    })
}

async fn tcreate(
    session: &mut Session,
    fid: u32,
    name: String,
    perm: u32,
    _mode: u8,
) -> Result<FCall, Error> {
    let state = session
        .fids
        .get(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?
        .clone();
    if !state.qid.typ.contains(QIdType::DIR) {
        return Err(Error::proto(string::NOT_A_DIRECTORY));
    }

    let new_path = join(&state.path, &name);
    let is_dir = perm & dm::DIR != 0;
    let handle = if is_dir {
        session.gateway.directory_create(&new_path).await?;
        session.gateway.open(&new_path).await?
    } else {
        session.gateway.create(&new_path).await?
    };

    let qid = QId {
        typ: if is_dir { QIdType::DIR } else { QIdType::FILE },
        version: 0,
        path: session.fids.next_qid_path(),
    };

    if let Some(slot) = session.fids.get_mut(fid) {
        slot.handle = handle;
        slot.opened = true;
        slot.qid = qid;
        slot.path = new_path;
    }

    Ok(FCall::RCreate {
        qid,
        iounit: iounit_for(session.msize),
    })
}

async fn tread(session: &mut Session, fid: u32, offset: u64, count: u32) -> Result<FCall, Error> {
    let state = session
        .fids
        .get(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?
        .clone();
    if !state.opened {
        return Err(Error::proto(string::NOT_ATTACHED));
    }

    let max_data = session.msize.saturating_sub(crate::session::HEADER_SIZE + 4);
    let count = count.min(max_data);

    if state.qid.typ.contains(QIdType::DIR) {
        let mut data = Vec::new();
        // offset is an entry-boundary cursor, not a byte seek (spec
        // §4.6); callers are expected to pass back what a prior Rread
        // consumed. We re-walk from the start and skip already-consumed
        // entries rather than keep a live cursor on the driver, which
        // keeps a directory fid resilient to interleaved Tstat calls.
        let mut skip = offset;
        loop {
            match session.gateway.directory_read(state.handle).await? {
                None => break,
                Some(entry) => {
                    if entry.name == "." || entry.name == ".." {
                        continue;
                    }
                    if skip > 0 {
                        skip -= 1;
                        continue;
                    }
                    let child_path = join(&state.path, &entry.name);
                    let meta = session.gateway.stat_path(&child_path).await?;
                    let stat = crate::fcall::Stat {
                        typ: 0,
                        dev: 0,
                        qid: QId {
                            typ: if meta.is_dir {
                                QIdType::DIR
                            } else {
                                QIdType::FILE
                            },
                            version: 0,
                            path: session.fids.next_qid_path(),
                        },
                        mode: meta.mode,
                        atime: meta.atime,
                        mtime: meta.mtime,
                        length: meta.length,
                        name: entry.name,
                        uid: "picocalc".to_owned(),
                        gid: "picocalc".to_owned(),
                        muid: "picocalc".to_owned(),
                        extension: String::new(),
                        n_uid: 1000,
                        n_gid: 1000,
                        n_muid: 1000,
                    };
                    let mut encoded = Vec::new();
                    crate::serialize::Encodable::encode(&stat, &mut encoded)
                        .map_err(|e| Error::fatal(e.to_string()))?;
                    if (data.len() + encoded.len()) as u32 > count {
                        break;
                    }
                    data.extend_from_slice(&encoded);
                }
            }
        }
        return Ok(FCall::RRead { data: Data(data) });
    }

    session.gateway.seek(state.handle, offset).await?;
    let mut buf = vec![0u8; count as usize];
    let n = session.gateway.read(state.handle, &mut buf).await?;
    buf.truncate(n as usize);
    Ok(FCall::RRead { data: Data(buf) })
}

async fn twrite(session: &mut Session, fid: u32, offset: u64, data: Data) -> Result<FCall, Error> {
    let state = session
        .fids
        .get(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?
        .clone();
    if state.qid.typ.contains(QIdType::DIR) {
        return Err(Error::proto(string::CANNOT_WRITE_DIRECTORY));
    }
    if !state.opened {
        return Err(Error::proto(string::NOT_ATTACHED));
    }
    session.gateway.seek(state.handle, offset).await?;
    let n = session.gateway.write(state.handle, &data.0).await?;
    Ok(FCall::RWrite { count: n })
}

async fn tclunk(session: &mut Session, fid: u32) -> Result<FCall, Error> {
    let state = session
        .fids
        .remove(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?;
    if state.opened {
        let _ = session.gateway.close(state.handle).await;
    }
    Ok(FCall::RClunk)
}

async fn tremove(session: &mut Session, fid: u32) -> Result<FCall, Error> {
    let state = session
        .fids
        .remove(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?;
    if state.opened {
        let _ = session.gateway.close(state.handle).await;
    }
    session.gateway.delete(&state.path).await?;
    Ok(FCall::RRemove)
}

async fn tstat(session: &mut Session, fid: u32) -> Result<FCall, Error> {
    let state = session
        .fids
        .get(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?
        .clone();
    let meta = session.gateway.stat_path(&state.path).await?;
    let (_, name) = parent_and_name(&state.path);
    let stat = crate::fcall::Stat {
        typ: 0,
        dev: 0,
        qid: state.qid,
        mode: meta.mode,
        atime: meta.atime,
        mtime: meta.mtime,
        length: meta.length,
        name: if state.path == "/" {
            "/".to_owned()
        } else {
            name
        },
        uid: "picocalc".to_owned(),
        gid: "picocalc".to_owned(),
        muid: "picocalc".to_owned(),
        extension: String::new(),
        n_uid: 1000,
        n_gid: 1000,
        n_muid: 1000,
    };
    Ok(FCall::RStat { stat })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iounit_never_drops_below_the_floor_at_the_negotiation_minimum() {
        // tversion never lets msize settle below MIN_NEGOTIATED_MSIZE, so
        // this is the smallest value iounit_for ever actually sees.
        assert_eq!(iounit_for(MIN_NEGOTIATED_MSIZE), IOUNIT_FLOOR);
    }

    #[test]
    fn msize_below_the_negotiation_minimum_cannot_satisfy_the_floor() {
        // iounit_for alone cannot reconcile a msize this small with the
        // floor; tversion's clamp is what keeps a real session from ever
        // calling it with a value below MIN_NEGOTIATED_MSIZE.
        assert!(iounit_for(256) < IOUNIT_FLOOR);
    }

    #[test]
    fn iounit_grows_with_msize_once_past_the_floor() {
        let small = iounit_for(MIN_NEGOTIATED_MSIZE);
        let large = iounit_for(MIN_NEGOTIATED_MSIZE + 4096);
        assert!(large > small);
    }
}

async fn twstat(session: &mut Session, fid: u32, stat: crate::fcall::Stat) -> Result<FCall, Error> {
    let state = session
        .fids
        .get(fid)
        .ok_or_else(|| Error::proto(string::UNKNOWN_FID))?
        .clone();
    if !stat.name.is_empty() {
        let (parent, _) = parent_and_name(&state.path);
        let new_path = join(&parent, &stat.name);
        session.gateway.rename(&state.path, &new_path).await?;
        if let Some(slot) = session.fids.get_mut(fid) {
            slot.path = new_path;
        }
    }
    Ok(FCall::RWStat)
}
