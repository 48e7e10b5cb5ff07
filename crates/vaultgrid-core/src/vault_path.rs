//! Vault path derivation.
//!
//! A new replica's physical path comes from one of two schemes:
//!
//! ```text
//!   graft   /tempZone/home/alice/a.dat  --trim 1-->  <vault>/home/alice/a.dat
//!   random  /tempZone/home/alice/a.dat  ---------->  <vault>/alice/3f/a0/a.dat.<nanos>
//! ```
//!
//! Graft paths are deterministic, so a later lookup can find the file again.
//! The zone-level trash segment is never trimmed away, keeping deleted
//! objects apart from live ones in the vault.

use std::path::{Component, Path, PathBuf};

use vaultgrid_types::{LogicalPath, ResourceIdentity, Timestamp, VaultScheme};

use crate::GridError;
use crate::policy::VaultPathPolicy;

#[derive(Debug, Clone)]
pub struct VaultPathResolver {
    max_path_len: usize,
    trash_segment: String,
}

impl VaultPathResolver {
    pub fn new(max_path_len: usize, trash_segment: impl Into<String>) -> Self {
        Self {
            max_path_len,
            trash_segment: trash_segment.into(),
        }
    }

    pub fn max_path_len(&self) -> usize {
        self.max_path_len
    }

    pub fn trash_segment(&self) -> &str {
        &self.trash_segment
    }

    /// Physical path for a new replica of `path` on `resource`.
    pub fn resolve(
        &self,
        policy: &VaultPathPolicy,
        resource: &ResourceIdentity,
        path: &LogicalPath,
        user: &str,
    ) -> Result<PathBuf, GridError> {
        let physical = match policy.scheme {
            VaultScheme::Graft => {
                let user = policy.add_user_name.then_some(user);
                self.graft(&resource.vault_path, path, user, policy.trim_count)
            }
            VaultScheme::Random => Self::random(&resource.vault_path, path, user),
        };
        self.check_len(&physical)?;
        Ok(physical)
    }

    /// `vault[/user]/<path minus trim leading segments>`.
    ///
    /// Trimming stops at the trash segment and never consumes the final
    /// segment.
    pub fn graft(
        &self,
        vault: &Path,
        path: &LogicalPath,
        user: Option<&str>,
        trim: usize,
    ) -> PathBuf {
        let segments: Vec<&str> = path.segments().collect();
        let mut start = 0;
        while start < trim && start + 1 < segments.len() {
            if start > 0 && segments[start] == self.trash_segment {
                break;
            }
            start += 1;
        }

        let mut physical = vault.to_path_buf();
        if let Some(user) = user {
            physical.push(user);
        }
        for segment in &segments[start..] {
            physical.push(segment);
        }
        physical
    }

    /// `vault/user/<h0>/<h1>/<name>.<nanos>` with `h0`, `h1` taken from a
    /// hash of a random value.
    pub fn random(vault: &Path, path: &LogicalPath, user: &str) -> PathBuf {
        let seed: u32 = rand::random();
        let hash = blake3::hash(&seed.to_le_bytes());
        let bytes = hash.as_bytes();

        vault
            .join(user)
            .join(format!("{:02x}", bytes[0]))
            .join(format!("{:02x}", bytes[1]))
            .join(format!("{}.{}", path.file_name(), Timestamp::now().as_nanos()))
    }

    pub fn check_len(&self, physical: &Path) -> Result<(), GridError> {
        let len = physical.as_os_str().len();
        if len > self.max_path_len {
            return Err(GridError::PathTooLong {
                path: physical.to_path_buf(),
                len,
                max: self.max_path_len,
            });
        }
        Ok(())
    }

    /// Returns true if `physical` lies strictly below `resource`'s vault root.
    pub fn is_in_vault(resource: &ResourceIdentity, physical: &Path) -> bool {
        Self::vault_relative(resource, physical).is_some()
    }

    /// `physical` relative to the vault root, if it is a plain descendant.
    pub fn vault_relative<'p>(resource: &ResourceIdentity, physical: &'p Path) -> Option<&'p Path> {
        let rel = physical.strip_prefix(&resource.vault_path).ok()?;
        let plain = rel.components().all(|c| matches!(c, Component::Normal(_)));
        (plain && rel.components().next().is_some()).then_some(rel)
    }

    /// Inverse of the default graft: the logical path a vault file would have
    /// if it were grafted with the zone trimmed. The zone is inserted when
    /// the vault-relative path does not already start with it.
    pub fn logical_path_from_physical(
        resource: &ResourceIdentity,
        zone: &str,
        physical: &Path,
    ) -> Result<LogicalPath, GridError> {
        let rel =
            Self::vault_relative(resource, physical).ok_or_else(|| GridError::PathNotInVault {
                path: physical.to_path_buf(),
                resource: resource.name.clone(),
            })?;
        let segments: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        let logical = if segments.first().map(String::as_str) == Some(zone) {
            format!("/{}", segments.join("/"))
        } else {
            format!("/{zone}/{}", segments.join("/"))
        };
        Ok(LogicalPath::new(logical)?)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;
    use vaultgrid_types::ResourceClass;

    use super::*;

    fn resolver() -> VaultPathResolver {
        VaultPathResolver::new(1088, "trash")
    }

    fn demo() -> ResourceIdentity {
        ResourceIdentity::new("demo", "localhost", ResourceClass::Normal, "/var/vault")
    }

    fn lp(s: &str) -> LogicalPath {
        LogicalPath::new(s).unwrap()
    }

    #[test_case("/z/home/alice/a.dat", 1, "/var/vault/home/alice/a.dat"; "trim zone")]
    #[test_case("/z/home/alice/a.dat", 0, "/var/vault/z/home/alice/a.dat"; "no trim")]
    #[test_case("/z/home/alice/a.dat", 2, "/var/vault/alice/a.dat"; "trim two")]
    #[test_case("/z/home/alice/a.dat", 9, "/var/vault/a.dat"; "never trims file name")]
    #[test_case("/z/trash/home/alice/a.dat", 3, "/var/vault/trash/home/alice/a.dat"; "stops at trash")]
    fn graft_paths(logical: &str, trim: usize, expected: &str) {
        let physical = resolver().graft(Path::new("/var/vault"), &lp(logical), None, trim);
        assert_eq!(physical, PathBuf::from(expected));
    }

    #[test]
    fn graft_inserts_user_name() {
        let policy = VaultPathPolicy {
            scheme: VaultScheme::Graft,
            add_user_name: true,
            trim_count: 2,
        };
        let physical = resolver()
            .resolve(&policy, &demo(), &lp("/z/home/alice/a.dat"), "bob")
            .unwrap();
        assert_eq!(physical, PathBuf::from("/var/vault/bob/alice/a.dat"));
    }

    #[test]
    fn random_paths_differ() {
        let policy = VaultPathPolicy {
            scheme: VaultScheme::Random,
            add_user_name: false,
            trim_count: 1,
        };
        let path = lp("/z/home/alice/a.dat");
        let first = resolver().resolve(&policy, &demo(), &path, "alice").unwrap();
        let second = resolver().resolve(&policy, &demo(), &path, "alice").unwrap();
        assert_ne!(first, second);

        let rel = first.strip_prefix("/var/vault/alice").unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert!(parts[2].starts_with("a.dat."));
    }

    #[test]
    fn overlong_path_is_rejected() {
        let short = VaultPathResolver::new(24, "trash");
        let err = short
            .resolve(
                &VaultPathPolicy::default(),
                &demo(),
                &lp("/z/home/alice/a-very-long-file-name.dat"),
                "alice",
            )
            .unwrap_err();
        assert!(matches!(err, GridError::PathTooLong { max: 24, .. }));
    }

    #[test]
    fn vault_membership() {
        let demo = demo();
        assert!(VaultPathResolver::is_in_vault(&demo, Path::new("/var/vault/home/a")));
        assert!(!VaultPathResolver::is_in_vault(&demo, Path::new("/var/vault")));
        assert!(!VaultPathResolver::is_in_vault(&demo, Path::new("/var/other/a")));
        assert!(!VaultPathResolver::is_in_vault(&demo, Path::new("/var/vault/../etc/passwd")));
    }

    #[test]
    fn logical_path_from_vault_file() {
        let demo = demo();
        let logical = VaultPathResolver::logical_path_from_physical(
            &demo,
            "tempZone",
            Path::new("/var/vault/home/alice/a.dat"),
        )
        .unwrap();
        assert_eq!(logical.as_str(), "/tempZone/home/alice/a.dat");

        let with_zone = VaultPathResolver::logical_path_from_physical(
            &demo,
            "tempZone",
            Path::new("/var/vault/tempZone/home/a.dat"),
        )
        .unwrap();
        assert_eq!(with_zone.as_str(), "/tempZone/home/a.dat");

        assert!(matches!(
            VaultPathResolver::logical_path_from_physical(&demo, "z", Path::new("/elsewhere/a")),
            Err(GridError::PathNotInVault { .. })
        ));
    }

    proptest! {
        #[test]
        fn graft_is_deterministic(segments in prop::collection::vec("[a-zA-Z0-9_.-]{1,12}", 2..8), trim in 0usize..4) {
            prop_assume!(segments.iter().all(|s| s != "." && s != ".."));
            let path = lp(&format!("/{}", segments.join("/")));
            let r = resolver();
            let first = r.graft(Path::new("/v"), &path, Some("u"), trim);
            let second = r.graft(Path::new("/v"), &path, Some("u"), trim);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn graft_keeps_trash_segment(rest in prop::collection::vec("[a-z]{1,8}", 1..6), trim in 0usize..8) {
            let path = lp(&format!("/zone/trash/{}", rest.join("/")));
            let physical = resolver().graft(Path::new("/v"), &path, None, trim);
            prop_assert!(physical.iter().any(|c| c == "trash"));
        }

        #[test]
        fn trim_one_graft_inverts(rest in prop::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            prop_assume!(rest[0] != "zone");
            let path = lp(&format!("/zone/{}", rest.join("/")));
            let demo = demo();
            let physical = resolver().graft(&demo.vault_path, &path, None, 1);
            let back = VaultPathResolver::logical_path_from_physical(&demo, "zone", &physical).unwrap();
            prop_assert_eq!(back, path);
        }
    }
}
