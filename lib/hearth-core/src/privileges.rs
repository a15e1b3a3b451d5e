//! User and group switching.

use nix::unistd::{getegid, geteuid, setgid, setuid, Gid, Group, Uid, User};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

/// Privilege errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PrivilegeError {
    /// The requested user does not exist.
    #[snafu(display("User '{}' does not exist.", user))]
    UnknownUser {
        /// Requested user.
        user: String,
    },

    /// The requested group does not exist.
    #[snafu(display("Group '{}' does not exist.", group))]
    UnknownGroup {
        /// Requested group.
        group: String,
    },

    /// Looking up a user or group in the system databases failed.
    #[snafu(display("Failed to look up user or group: {}", source))]
    Lookup {
        /// Underlying system error.
        source: nix::Error,
    },

    /// The current process is not allowed to change its user or group.
    #[snafu(display(
        "Cannot switch to user '{}' and group '{}': only root can change the user or group of a process.",
        user,
        group
    ))]
    NotPermitted {
        /// Requested user.
        user: String,

        /// Requested group.
        group: String,
    },

    /// Changing the group of the process failed.
    #[snafu(display("Failed to switch to group '{}': {}", group, source))]
    SetGroup {
        /// Requested group.
        group: String,

        /// Underlying system error.
        source: nix::Error,
    },

    /// Changing the user of the process failed.
    #[snafu(display("Failed to switch to user '{}': {}", user, source))]
    SetUser {
        /// Requested user.
        user: String,

        /// Underlying system error.
        source: nix::Error,
    },
}

/// Returns the name of the effective user of the current process.
///
/// Falls back to the numeric user ID if the user has no entry in the user database.
pub fn current_user() -> String {
    let uid = geteuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Returns the name of the effective group of the current process.
///
/// Falls back to the numeric group ID if the group has no entry in the group database.
pub fn current_group() -> String {
    let gid = getegid();
    match Group::from_gid(gid) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

/// Switches the current process to the given user and group.
///
/// When only a user is given, the group defaults to the primary group of that user. When neither is given, or the
/// process is already running as the requested user and group, nothing is changed.
///
/// # Errors
///
/// If the user or group doesn't exist, if the process isn't running as root, or if the underlying system calls fail,
/// an error is returned. The process is left running as its current user and group in all of those cases, except when
/// the group was switched but switching the user then failed.
pub fn set_user_and_group(user: Option<&str>, group: Option<&str>) -> Result<(), PrivilegeError> {
    if user.is_none() && group.is_none() {
        return Ok(());
    }

    let target_user = match user {
        Some(name) => Some(User::from_name(name).context(Lookup)?.context(UnknownUser { user: name })?),
        None => None,
    };

    let target_gid = match group {
        Some(name) => Some(Group::from_name(name).context(Lookup)?.context(UnknownGroup { group: name })?.gid),
        None => target_user.as_ref().map(|user| user.gid),
    };
    let target_uid = target_user.as_ref().map(|user| user.uid);

    let uid_change = target_uid.filter(|uid| *uid != geteuid());
    let gid_change = target_gid.filter(|gid| *gid != getegid());
    if uid_change.is_none() && gid_change.is_none() {
        return Ok(());
    }

    let user_name = user.map(str::to_string).unwrap_or_else(current_user);
    let group_name = group
        .map(str::to_string)
        .or_else(|| target_gid.map(group_name_for))
        .unwrap_or_else(current_group);

    if !geteuid().is_root() {
        return Err(PrivilegeError::NotPermitted {
            user: user_name,
            group: group_name,
        });
    }

    // The group must be changed first, as we lose the privilege to do so once we're no longer root.
    if let Some(gid) = gid_change {
        drop_supplementary_groups(gid).context(SetGroup { group: &group_name })?;
        setgid(gid).context(SetGroup { group: &group_name })?;
    }

    if let Some(uid) = uid_change {
        switch_user(uid).context(SetUser { user: &user_name })?;
    }

    Ok(())
}

fn group_name_for(gid: Gid) -> String {
    match Group::from_gid(gid) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

#[cfg(target_os = "linux")]
fn drop_supplementary_groups(gid: Gid) -> nix::Result<()> {
    nix::unistd::setgroups(&[gid])
}

#[cfg(not(target_os = "linux"))]
fn drop_supplementary_groups(_gid: Gid) -> nix::Result<()> {
    Ok(())
}

fn switch_user(uid: Uid) -> nix::Result<()> {
    setuid(uid)
}
