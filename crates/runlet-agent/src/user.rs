//! Image user resolution
//!
//! An image's `USER` may be `name`, `uid`, `name:group`, `uid:gid` or a mix.
//! Names are looked up in the image's own `/etc/passwd` and `/etc/group`.

use crate::error::{AgentError, Result};

pub const PASSWD_PATH: &str = "/etc/passwd";
pub const GROUP_PATH: &str = "/etc/group";

/// Credentials the container process runs with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

/// Numeric `uid:gid` needs no lookup; everything else does
pub fn parse_numeric(user: &str) -> Option<(u32, u32)> {
    let (uid, gid) = user.split_once(':')?;
    Some((uid.parse().ok()?, gid.parse().ok()?))
}

#[derive(Debug)]
struct PasswdEntry<'a> {
    name: &'a str,
    uid: u32,
    gid: u32,
}

#[derive(Debug)]
struct GroupEntry<'a> {
    name: &'a str,
    gid: u32,
    members: Vec<&'a str>,
}

fn records(contents: &str) -> impl Iterator<Item = Vec<&str>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').collect())
}

// Malformed lines are skipped, as libc does
fn parse_passwd(contents: &str) -> Vec<PasswdEntry<'_>> {
    records(contents)
        .filter_map(|fields| {
            if fields.len() < 4 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0],
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
            })
        })
        .collect()
}

fn parse_group(contents: &str) -> Vec<GroupEntry<'_>> {
    records(contents)
        .filter_map(|fields| {
            if fields.len() < 3 {
                return None;
            }
            let members = fields
                .get(3)
                .map(|m| m.split(',').filter(|s| !s.is_empty()).collect())
                .unwrap_or_default();
            Some(GroupEntry {
                name: fields[0],
                gid: fields[2].parse().ok()?,
                members,
            })
        })
        .collect()
}

/// Resolve `user` against the image's passwd and group files (either may be
/// missing). A bare uid takes its primary group from passwd, falling back to
/// gid 0; a name that is not listed is an error.
pub fn resolve_user(user: &str, passwd: Option<&str>, group: Option<&str>) -> Result<ResolvedUser> {
    let users = passwd.map(parse_passwd).unwrap_or_default();
    let groups = group.map(parse_group).unwrap_or_default();
    let err = |reason: String| AgentError::SpecBuild(format!("user '{}': {}", user, reason));

    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };
    if user_part.is_empty() {
        return Err(err("empty user name".to_string()));
    }

    let entry = match user_part.parse::<u32>() {
        Ok(uid) => users.iter().find(|e| e.uid == uid),
        Err(_) => Some(
            users
                .iter()
                .find(|e| e.name == user_part)
                .ok_or_else(|| err(format!("no such user in {}", PASSWD_PATH)))?,
        ),
    };
    let uid = match entry {
        Some(e) => e.uid,
        None => user_part
            .parse()
            .map_err(|_| err("invalid uid".to_string()))?,
    };

    let gid = match group_part {
        None => entry.map(|e| e.gid).unwrap_or(0),
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => groups
                .iter()
                .find(|e| e.name == g)
                .map(|e| e.gid)
                .ok_or_else(|| err(format!("no such group '{}' in {}", g, GROUP_PATH)))?,
        },
    };

    let mut additional_gids = Vec::new();
    if let Some(name) = entry.map(|e| e.name) {
        for g in &groups {
            if g.gid != gid && g.members.contains(&name) && !additional_gids.contains(&g.gid) {
                additional_gids.push(g.gid);
            }
        }
    }

    Ok(ResolvedUser {
        uid,
        gid,
        additional_gids,
    })
}
