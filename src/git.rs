//! Reading and rewriting the current commit of a git repository.

use crate::{hash_git_commit, search_for_prefix, HashPrefix, InvalidInputError, PaddingMatch};
use std::{
    io::{self, Write},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {args:?}")]
    Spawn {
        args: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("git {args:?} finished with {status}")]
    Failed { args: Vec<String>, status: ExitStatus },

    #[error("malformed commit object: {0}")]
    MalformedCommit(String),

    #[error("the current commit has an empty message, so there is nowhere to put padding")]
    EmptyMessage,

    #[error(
        "the current commit is signed, and amending it would drop the signature and change its \
        hash; the commit was left untouched"
    )]
    SignedCommit,

    #[error(
        "found a matching commit ({expected}), but the amended commit unexpectedly has hash \
        {actual}; the original commit is still available in the reflog"
    )]
    HashMismatch { expected: String, actual: String },

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),
}

/// The parts of the current commit needed to rewrite it faithfully.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CommitMetadata {
    pub committer_name: String,
    pub committer_email: String,
    /// The committer date in git's internal format, e.g. `1513980898 -0500`
    pub committer_date: String,
    /// The raw commit message, including its trailing newline
    pub message: Vec<u8>,
    /// Whether the commit carries a `gpgsig` or `gpgsig-sha256` header
    pub is_signed: bool,
}

impl CommitMetadata {
    /// Parses metadata out of a raw commit object, as printed by `git cat-file commit`.
    pub fn parse(commit: &[u8]) -> Result<Self, GitError> {
        let malformed = |reason: &str| GitError::MalformedCommit(reason.to_owned());

        let separator = commit
            .windows(2)
            .position(|window| window == b"\n\n")
            .ok_or_else(|| malformed("missing blank line before message"))?;
        let (headers, message) = (&commit[..separator], &commit[separator + 2..]);

        let is_signed = headers.split(|&byte| byte == b'\n').any(|line| {
            line.starts_with(b"gpgsig ") || line.starts_with(b"gpgsig-sha256 ")
        });

        let committer = headers
            .split(|&byte| byte == b'\n')
            .find_map(|line| line.strip_prefix(b"committer "))
            .ok_or_else(|| malformed("missing committer line"))?;
        let committer = std::str::from_utf8(committer)
            .map_err(|_| malformed("committer line is not valid utf8"))?;

        // "Name <email> <timestamp> <timezone>"
        let (identity, timezone) = committer
            .rsplit_once(' ')
            .ok_or_else(|| malformed("committer line has no date"))?;
        let (identity, timestamp) = identity
            .rsplit_once(' ')
            .ok_or_else(|| malformed("committer line has no date"))?;
        let (name, email) = identity
            .strip_suffix('>')
            .and_then(|identity| identity.rsplit_once(" <"))
            .ok_or_else(|| malformed("committer line has no email"))?;

        Ok(Self {
            committer_name: name.to_owned(),
            committer_email: email.to_owned(),
            committer_date: format!("{} {}", timestamp, timezone),
            message: message.to_vec(),
            is_signed,
        })
    }

    /// The message with `padding` inserted before its final newline.
    pub fn padded_message(&self, padding: &str) -> Vec<u8> {
        let stem = self.message.strip_suffix(b"\n").unwrap_or(&self.message[..]);
        let mut message = Vec::with_capacity(stem.len() + padding.len() + 1);
        message.extend_from_slice(stem);
        message.extend_from_slice(padding.as_bytes());
        message.push(b'\n');
        message
    }
}

/// Access to the current commit of a repository.
pub trait CommitRepository {
    /// Returns the current commit in git's canonical encoding, without the object header.
    fn read_current_commit_object(&mut self) -> Result<Vec<u8>, GitError>;

    fn read_current_commit_metadata(&mut self) -> Result<CommitMetadata, GitError>;

    /// Replaces the current commit with one that has `new_message` as its message, keeping the
    /// tree, parents, author, and the committer identity and date from `metadata`.
    fn amend_current_commit(
        &mut self,
        new_message: &[u8],
        metadata: &CommitMetadata,
    ) -> Result<(), GitError>;
}

/// A repository accessed by running the `git` executable.
#[derive(Debug, Default, Clone)]
pub struct GitCommandRepository {
    work_dir: Option<PathBuf>,
}

impl GitCommandRepository {
    /// Uses the repository containing the current directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the repository containing `work_dir`.
    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
        }
    }

    fn spawn_git(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, GitError> {
        debug!(?args, "spawning git");
        let owned_args = || args.iter().map(|&arg| arg.to_owned()).collect::<Vec<_>>();
        let spawn_error = |source| GitError::Spawn {
            args: owned_args(),
            source,
        };

        let mut command = Command::new("git");
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .args(args)
            .envs(envs.iter().copied())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).map_err(spawn_error)?;
        }

        let output = child.wait_with_output().map_err(spawn_error)?;

        if !output.status.success() {
            return Err(GitError::Failed {
                args: owned_args(),
                status: output.status,
            });
        }

        Ok(output.stdout)
    }
}

impl CommitRepository for GitCommandRepository {
    fn read_current_commit_object(&mut self) -> Result<Vec<u8>, GitError> {
        self.spawn_git(&["cat-file", "commit", "HEAD"], &[], None)
    }

    fn read_current_commit_metadata(&mut self) -> Result<CommitMetadata, GitError> {
        CommitMetadata::parse(&self.read_current_commit_object()?)
    }

    fn amend_current_commit(
        &mut self,
        new_message: &[u8],
        metadata: &CommitMetadata,
    ) -> Result<(), GitError> {
        // `--only` without paths leaves staged changes out of the amended commit, and the
        // message is read from stdin so it never has to pass through an argument or a shell.
        self.spawn_git(
            &[
                "commit",
                "--amend",
                "--only",
                "--allow-empty",
                "--no-verify",
                "--no-gpg-sign",
                "--cleanup=verbatim",
                "--quiet",
                "--file=-",
            ],
            &[
                ("GIT_COMMITTER_NAME", metadata.committer_name.as_str()),
                ("GIT_COMMITTER_EMAIL", metadata.committer_email.as_str()),
                ("GIT_COMMITTER_DATE", metadata.committer_date.as_str()),
            ],
            Some(new_message),
        )
        .map(drop)
    }
}

/// Pads the message of the repository's current commit so that its hash starts with
/// `desired_prefix`, then amends the commit and checks that it got the expected hash.
pub fn amend_with_prefix(
    repository: &mut impl CommitRepository,
    desired_prefix: &HashPrefix,
) -> Result<PaddingMatch, GitError> {
    let current_commit = repository.read_current_commit_object()?;
    let metadata = repository.read_current_commit_metadata()?;
    if metadata.message.is_empty() {
        return Err(GitError::EmptyMessage);
    }
    if metadata.is_signed {
        return Err(GitError::SignedCommit);
    }

    info!(
        prefix = %desired_prefix,
        estimated_attempts = desired_prefix.estimated_attempts(),
        "searching for padding"
    );
    let found = search_for_prefix(&current_commit, desired_prefix)?;

    repository.amend_current_commit(&metadata.padded_message(&found.padding), &metadata)?;

    let actual = hash_git_commit(&repository.read_current_commit_object()?);
    if actual != found.hash {
        return Err(GitError::HashMismatch {
            expected: found.hash,
            actual,
        });
    }

    info!(hash = %found.hash, "amended the current commit");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEST_COMMIT: &[u8] = b"\
        tree 0123456701234567012345670123456701234567\n\
        parent 7654321076543210765432107654321076543210\n\
        author Foo B\xc3\xa1r <foo@example.com> 1513980859 -0500\n\
        committer Baz Qux <baz@example.com> 1513980898 -0500\n\
        \n\
        Do a thing\n\
        \n\
        Makes some changes to the foo feature\n";

    /// Stores a single commit in memory. Amending splices the new message onto the old headers,
    /// the way git would for an unsigned commit.
    struct FakeRepository {
        commit: Vec<u8>,
        amended_with: Option<(Vec<u8>, CommitMetadata)>,
        drop_headers_on_amend: bool,
    }

    impl FakeRepository {
        fn new(commit: &[u8]) -> Self {
            Self {
                commit: commit.to_vec(),
                amended_with: None,
                drop_headers_on_amend: false,
            }
        }
    }

    impl CommitRepository for FakeRepository {
        fn read_current_commit_object(&mut self) -> Result<Vec<u8>, GitError> {
            Ok(self.commit.clone())
        }

        fn read_current_commit_metadata(&mut self) -> Result<CommitMetadata, GitError> {
            CommitMetadata::parse(&self.commit)
        }

        fn amend_current_commit(
            &mut self,
            new_message: &[u8],
            metadata: &CommitMetadata,
        ) -> Result<(), GitError> {
            let separator = self
                .commit
                .windows(2)
                .position(|window| window == b"\n\n")
                .unwrap();
            let mut commit = if self.drop_headers_on_amend {
                Vec::new()
            } else {
                self.commit[..separator + 2].to_vec()
            };
            commit.extend_from_slice(new_message);
            self.commit = commit;
            self.amended_with = Some((new_message.to_vec(), metadata.clone()));
            Ok(())
        }
    }

    #[test]
    fn parse_metadata() {
        assert_eq!(
            CommitMetadata {
                committer_name: "Baz Qux".to_owned(),
                committer_email: "baz@example.com".to_owned(),
                committer_date: "1513980898 -0500".to_owned(),
                message: b"Do a thing\n\nMakes some changes to the foo feature\n".to_vec(),
                is_signed: false,
            },
            CommitMetadata::parse(TEST_COMMIT).unwrap()
        );
    }

    const SIGNED_COMMIT: &[u8] = b"\
        tree 0123456701234567012345670123456701234567\n\
        author Foo <foo@example.com> 1513980859 -0500\n\
        committer Ann Lee <ann@example.com> 1600000000 +0130\n\
        gpgsig -----BEGIN PGP SIGNATURE-----\n \n AAAA\n -----END PGP SIGNATURE-----\n\
        \n\
        Signed\n";

    #[test]
    fn parse_metadata_with_signature() {
        let metadata = CommitMetadata::parse(SIGNED_COMMIT).unwrap();
        assert_eq!("Ann Lee", metadata.committer_name);
        assert_eq!("1600000000 +0130", metadata.committer_date);
        assert_eq!(b"Signed\n".to_vec(), metadata.message);
        assert!(metadata.is_signed);
    }

    #[test]
    fn parse_metadata_with_sha256_signature() {
        let commit = b"\
            tree 0123456701234567012345670123456701234567\n\
            author Foo <foo@example.com> 1513980859 -0500\n\
            committer Ann Lee <ann@example.com> 1600000000 +0130\n\
            gpgsig-sha256 -----BEGIN PGP SIGNATURE-----\n AAAA\n -----END PGP SIGNATURE-----\n\
            \n\
            Signed\n";
        assert!(CommitMetadata::parse(commit).unwrap().is_signed);
    }

    #[test]
    fn parse_metadata_with_signature_marker_in_message() {
        let commit = b"\
            tree 0123456701234567012345670123456701234567\n\
            committer Baz Qux <baz@example.com> 1513980898 -0500\n\
            \n\
            For no particular reason, this commit message looks like a signature.\n\
            gpgsig -----END PGP SIGNATURE-----\n";
        assert!(!CommitMetadata::parse(commit).unwrap().is_signed);
    }

    #[test]
    fn parse_metadata_without_message_separator() {
        assert!(matches!(
            CommitMetadata::parse(b"tree abc\ncommitter A <a@b> 0 +0000\n"),
            Err(GitError::MalformedCommit(_))
        ));
    }

    #[test]
    fn parse_metadata_without_committer() {
        assert!(matches!(
            CommitMetadata::parse(b"tree abc\nauthor A <a@b> 0 +0000\n\nhello\n"),
            Err(GitError::MalformedCommit(_))
        ));
    }

    #[test]
    fn padded_message_replaces_final_newline() {
        let metadata = CommitMetadata::parse(TEST_COMMIT).unwrap();
        assert_eq!(
            b"Do a thing\n\nMakes some changes to the foo feature \t\t\n".to_vec(),
            metadata.padded_message(" \t\t")
        );
    }

    #[test]
    fn amend_with_prefix_rewrites_commit() {
        let mut repository = FakeRepository::new(TEST_COMMIT);
        let prefix = HashPrefix::new("ab").unwrap();

        let found = amend_with_prefix(&mut repository, &prefix).unwrap();

        assert!(found.hash.starts_with("ab"));
        assert_eq!(found.commit, repository.commit);
        assert_eq!(found.hash, hash_git_commit(&repository.commit));

        let (message, metadata) = repository.amended_with.unwrap();
        assert_eq!(
            format!(
                "Do a thing\n\nMakes some changes to the foo feature{}\n",
                found.padding
            )
            .into_bytes(),
            message
        );
        assert_eq!("1513980898 -0500", metadata.committer_date);
    }

    #[test]
    fn amend_with_prefix_detects_hash_mismatch() {
        let mut repository = FakeRepository::new(TEST_COMMIT);
        repository.drop_headers_on_amend = true;

        assert!(matches!(
            amend_with_prefix(&mut repository, &HashPrefix::new("0").unwrap()),
            Err(GitError::HashMismatch { .. })
        ));
    }

    #[test]
    fn amend_with_prefix_leaves_signed_commit_untouched() {
        let mut repository = FakeRepository::new(SIGNED_COMMIT);

        assert!(matches!(
            amend_with_prefix(&mut repository, &HashPrefix::new("0").unwrap()),
            Err(GitError::SignedCommit)
        ));
        assert!(repository.amended_with.is_none());
        assert_eq!(SIGNED_COMMIT.to_vec(), repository.commit);
    }

    #[test]
    fn amend_with_prefix_refuses_empty_message() {
        let mut repository =
            FakeRepository::new(b"tree abc\ncommitter A <a@example.com> 0 +0000\n\n");

        assert!(matches!(
            amend_with_prefix(&mut repository, &HashPrefix::default()),
            Err(GitError::EmptyMessage)
        ));
        assert!(repository.amended_with.is_none());
    }
}
