//! User and group directory.
//!
//! Users and groups share one table. Each record has an id, a name, an
//! optional group leader and a member list; a group is simply a user whose
//! member list is consulted. Entries store ids; clients see names.
//!
//! The text form, used by the `users` control file, has one record per line:
//!
//! ```text
//! uid name [leader [member ...]]
//! - name ...          # delete by name
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetaError, MetaResult};

/// Largest users file write accepted.
pub const MAX_USERS_TEXT: usize = 16 * 1024;

const MAX_FIELDS: usize = 100;

/// Lookups the filesystem needs from a user directory.
pub trait UserDirectory {
    /// Id of the user called `name`.
    fn lookup_by_name(&self, name: &str) -> Option<&str>;

    /// Name of the user with id `uid`.
    fn lookup_by_id(&self, uid: &str) -> Option<&str>;

    /// Returns true if `uid` belongs to group `gid`.
    fn is_member(&self, uid: &str, gid: &str) -> bool;

    /// Returns true if `uid` may act for group `gid`.
    fn leads_group(&self, uid: &str, gid: &str) -> bool;
}

/// One user or group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Id stored in entries.
    pub uid: String,
    /// Name shown to clients.
    pub name: String,
    /// Group leader id.
    pub leader: Option<String>,
    /// Member ids.
    pub members: Vec<String>,
}

/// In-memory user directory.
#[derive(Clone, Debug, Default)]
pub struct UserTable {
    by_uid: BTreeMap<String, User>,
    by_name: HashMap<String, String>,
}

/// Reject names that cannot appear in the text form.
pub fn check_name(s: &str) -> MetaResult<()> {
    if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
        return Err(MetaError::BadUsers(format!("illegal name {:?}", s)));
    }
    let bad = |c: char| {
        (c as u32) < 0x20 || ((c as u32) >= 0x7F && (c as u32) < 0xA0) || "#:,()".contains(c)
    };
    if s.chars().any(bad) {
        return Err(MetaError::BadUsers(format!(
            "invalid character in name {:?}",
            s
        )));
    }
    Ok(())
}

/// Split a line into fields. Single quotes group text; `''` inside quotes is
/// a literal quote.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }
        let mut field = String::new();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            if quoted {
                if c == '\'' {
                    if chars.next_if_eq(&'\'').is_some() {
                        field.push('\'');
                    } else {
                        quoted = false;
                    }
                } else {
                    field.push(c);
                }
            } else if c == '\'' {
                quoted = true;
            } else if c.is_whitespace() {
                break;
            } else {
                field.push(c);
            }
        }
        out.push(field);
    }
    out
}

fn quote(s: &str) -> String {
    if !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || c == '\'') {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "''"))
}

impl UserTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users.
    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    /// Returns true if there are no users.
    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }

    /// Look up a record by id.
    pub fn get(&self, uid: &str) -> Option<&User> {
        self.by_uid.get(uid)
    }

    /// Add a user, replacing any existing user with the same id.
    pub fn add(
        &mut self,
        uid: &str,
        name: &str,
        leader: Option<&str>,
        members: &[&str],
    ) -> MetaResult<()> {
        let leader = leader.filter(|l| !l.is_empty());
        check_name(uid)?;
        check_name(name)?;
        if let Some(l) = leader {
            check_name(l)?;
        }
        for m in members {
            check_name(m)?;
        }
        if let Some(owner) = self.by_name.get(name) {
            if owner != uid {
                return Err(MetaError::BadUsers(format!("duplicate uname {:?}", name)));
            }
        }
        if let Some(old) = self.by_uid.remove(uid) {
            self.by_name.remove(&old.name);
        }
        self.by_name.insert(name.to_string(), uid.to_string());
        self.by_uid.insert(
            uid.to_string(),
            User {
                uid: uid.to_string(),
                name: name.to_string(),
                leader: leader.map(str::to_string),
                members: members.iter().map(|m| m.to_string()).collect(),
            },
        );
        debug!(uid, name, "added user");
        Ok(())
    }

    /// Delete the user called `name`. Returns false if there was none.
    pub fn remove_by_name(&mut self, name: &str) -> bool {
        match self.by_name.remove(name) {
            Some(uid) => {
                self.by_uid.remove(&uid);
                debug!(uid = %uid, name, "removed user");
                true
            }
            None => false,
        }
    }

    /// Apply records in the text form. The text must end with a newline.
    pub fn apply_text(&mut self, text: &str) -> MetaResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        if text.len() > MAX_USERS_TEXT {
            return Err(MetaError::TooLong);
        }
        if !text.ends_with('\n') {
            return Err(MetaError::BadUsers("incomplete line".to_string()));
        }
        for line in text.lines() {
            if line.starts_with('#') {
                continue;
            }
            let fields = tokenize(line);
            if fields.len() >= MAX_FIELDS {
                return Err(MetaError::BadUsers("too many group members".to_string()));
            }
            let f: Vec<&str> = fields.iter().map(String::as_str).collect();
            match f.as_slice() {
                [] => {}
                ["-", names @ ..] => {
                    for n in names {
                        self.remove_by_name(n);
                    }
                }
                [uid] => self.add(uid, uid, None, &[])?,
                [uid, name] => self.add(uid, name, None, &[])?,
                [uid, name, leader, members @ ..] => self.add(uid, name, Some(*leader), members)?,
            }
        }
        Ok(())
    }

    /// The `uname` control command: `name [id [leader [member ...]]]` adds,
    /// `- name ...` deletes. Note that name comes before id here.
    pub fn uname(&mut self, args: &[&str]) -> MetaResult<()> {
        match args {
            [] => Err(MetaError::BadControl),
            ["-", names @ ..] => {
                for n in names {
                    self.remove_by_name(n);
                }
                Ok(())
            }
            [name] => self.add(name, name, None, &[]),
            [name, uid] => self.add(uid, name, None, &[]),
            [name, uid, leader, members @ ..] => self.add(uid, name, Some(*leader), members),
        }
    }

    /// Render the table in the text form, ordered by id.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for u in self.by_uid.values() {
            out.push_str(&quote(&u.uid));
            out.push(' ');
            out.push_str(&quote(&u.name));
            if u.leader.is_some() || !u.members.is_empty() {
                out.push(' ');
                out.push_str(&quote(u.leader.as_deref().unwrap_or("")));
                for m in &u.members {
                    out.push(' ');
                    out.push_str(&quote(m));
                }
            }
            out.push('\n');
        }
        out
    }
}

impl UserDirectory for UserTable {
    fn lookup_by_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    fn lookup_by_id(&self, uid: &str) -> Option<&str> {
        self.by_uid.get(uid).map(|u| u.name.as_str())
    }

    fn is_member(&self, uid: &str, gid: &str) -> bool {
        uid == gid
            || self
                .by_uid
                .get(gid)
                .is_some_and(|g| g.members.iter().any(|m| m == uid))
    }

    fn leads_group(&self, uid: &str, gid: &str) -> bool {
        match self.by_uid.get(gid) {
            Some(g) => match &g.leader {
                Some(leader) => leader == uid,
                None => g.members.iter().any(|m| m == uid),
            },
            None => uid == gid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> UserTable {
        let mut t = UserTable::new();
        t.apply_text(
            "# users\n\
             adm adm\n\
             glenda glenda\n\
             sys sys glenda glenda bob\n\
             bob bob\n\
             upas upas '' bob\n",
        )
        .unwrap();
        t
    }

    #[test]
    fn test_lookups() {
        let t = table();
        assert_eq!(t.len(), 5);
        assert_eq!(t.lookup_by_name("glenda"), Some("glenda"));
        assert_eq!(t.lookup_by_id("sys"), Some("sys"));
        assert_eq!(t.lookup_by_name("nobody"), None);
    }

    #[test]
    fn test_membership_and_leadership() {
        let t = table();
        assert!(t.is_member("bob", "sys"));
        assert!(t.is_member("adm", "adm"));
        assert!(!t.is_member("adm", "sys"));
        assert!(t.leads_group("glenda", "sys"));
        assert!(!t.leads_group("bob", "sys"));
        // no leader: every member leads
        assert!(t.leads_group("bob", "upas"));
        // no such group: a user leads their own id
        assert!(t.leads_group("ghost", "ghost"));
        assert!(!t.leads_group("ghost", "other"));
    }

    #[test]
    fn test_render_round_trip() {
        let t = table();
        let text = t.render();
        assert!(text.contains("upas upas '' bob\n"));
        assert!(text.contains("adm adm\n"));
        let mut again = UserTable::new();
        again.apply_text(&text).unwrap();
        assert_eq!(again.render(), text);
    }

    #[test]
    fn test_delete_and_replace() {
        let mut t = table();
        t.apply_text("- bob\n").unwrap();
        assert_eq!(t.lookup_by_name("bob"), None);
        t.apply_text("glenda gl\n").unwrap();
        assert_eq!(t.lookup_by_id("glenda"), Some("gl"));
        assert_eq!(t.lookup_by_name("glenda"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut t = table();
        let err = t.add("other", "glenda", None, &[]).unwrap_err();
        assert!(matches!(err, MetaError::BadUsers(_)));
    }

    #[test]
    fn test_bad_text() {
        let mut t = UserTable::new();
        assert!(matches!(
            t.apply_text("adm adm").unwrap_err(),
            MetaError::BadUsers(_)
        ));
        assert!(t.apply_text("-adm adm\n").is_err());
        assert!(t.apply_text("a:b a\n").is_err());
        assert!(t.is_empty());
    }

    #[test]
    fn test_uname_reverses_fields() {
        let mut t = UserTable::new();
        t.uname(&["alice", "u100"]).unwrap();
        assert_eq!(t.lookup_by_name("alice"), Some("u100"));
        t.uname(&["-", "alice"]).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(tokenize("  a 'b c' '' 'it''s'"), vec!["a", "b c", "", "it's"]);
        assert!(tokenize("   ").is_empty());
    }
}
