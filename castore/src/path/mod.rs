//! Relative, platform-independent paths inside a mount, used to address
//! entries in snapshot trees and to report journal and diff results.
use bstr::ByteSlice;
use std::{
    borrow::Borrow,
    fmt::{self, Debug, Display},
    mem,
    ops::Deref,
    str::FromStr,
};

mod component;
pub use component::{PathComponent, PathComponentError};

/// A borrowed repository path. These are always relative, and
/// platform-independent, which distinguishes them from the ones provided in
/// the standard library.
#[derive(Eq, Hash, PartialEq)]
#[repr(transparent)] // SAFETY: Representation has to match [u8]
pub struct RepoPath {
    // As entry names cannot contain slashes,
    // we use them as component separators here.
    inner: [u8],
}

impl RepoPath {
    // SAFETY: The empty path is valid.
    pub const ROOT: &'static RepoPath = unsafe { RepoPath::from_bytes_unchecked(&[]) };

    /// Convert a byte slice to a path, without checking validity.
    const unsafe fn from_bytes_unchecked(bytes: &[u8]) -> &RepoPath {
        // SAFETY: &[u8] and &RepoPath have the same representation.
        unsafe { mem::transmute(bytes) }
    }

    fn from_bytes(bytes: &[u8]) -> Option<&RepoPath> {
        if !bytes.is_empty() {
            // Ensure all components are valid entry names.
            for component in bytes.split_str(b"/") {
                component::validate_name(component).ok()?;
            }
        }

        // SAFETY: We have verified that the path contains no empty components.
        Some(unsafe { RepoPath::from_bytes_unchecked(bytes) })
    }

    /// Returns the path without its final component, if there is one.
    ///
    /// Note that the parent of a bare file name is [RepoPath::ROOT].
    /// [RepoPath::ROOT] is the only path without a parent.
    pub fn parent(&self) -> Option<&RepoPath> {
        // The root does not have a parent.
        if self.inner.is_empty() {
            return None;
        }

        Some(
            if let Some((parent, _file_name)) = self.inner.rsplit_once_str(b"/") {
                // SAFETY: The parent of a valid RepoPath is a valid RepoPath.
                unsafe { RepoPath::from_bytes_unchecked(parent) }
            } else {
                // The parent of a bare file name is the root.
                RepoPath::ROOT
            },
        )
    }

    /// Creates a RepoPathBuf with `name` adjoined to self.
    pub fn try_join(&self, name: &[u8]) -> Result<RepoPathBuf, std::io::Error> {
        let mut v = RepoPathBuf::with_capacity(self.inner.len() + name.len() + 1);
        v.inner.extend_from_slice(&self.inner);
        v.try_push(name)?;

        Ok(v)
    }

    /// Creates a RepoPathBuf with a validated [PathComponent] adjoined to
    /// self. Unlike [RepoPath::try_join] this cannot fail.
    pub fn join(&self, name: &PathComponent) -> RepoPathBuf {
        let mut v = RepoPathBuf::with_capacity(self.inner.len() + name.as_ref().len() + 1);
        v.inner.extend_from_slice(&self.inner);
        if !v.inner.is_empty() {
            v.inner.push(b'/');
        }
        v.inner.extend_from_slice(name.as_ref());
        v
    }

    /// Provides an iterator over the components of the path,
    /// which are individual [PathComponent].
    /// In case the path is empty, an empty iterator is returned.
    pub fn components(&self) -> impl Iterator<Item = PathComponent> + '_ {
        let mut iter = self.inner.split_str(&b"/");

        // We don't want to return an empty element, consume it if it's the only one.
        if self.inner.is_empty() {
            let _ = iter.next();
        }

        iter.map(|b| PathComponent {
            inner: bytes::Bytes::copy_from_slice(b),
        })
    }

    /// Produces an iterator over the components of the path, which are
    /// individual byte slices.
    /// In case the path is empty, an empty iterator is returned.
    pub fn components_bytes(&self) -> impl Iterator<Item = &[u8]> {
        let mut iter = self.inner.split_str(&b"/");

        // We don't want to return an empty element, consume it if it's the only one.
        if self.inner.is_empty() {
            let _ = iter.next();
        }

        iter
    }

    /// Returns the final component of the path, if there is one.
    pub fn file_name(&self) -> Option<PathComponent> {
        self.components().last()
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

impl AsRef<RepoPath> for RepoPath {
    fn as_ref(&self) -> &RepoPath {
        self
    }
}

/// An owned repository path.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct RepoPathBuf {
    inner: Vec<u8>,
}

impl Deref for RepoPathBuf {
    type Target = RepoPath;

    fn deref(&self) -> &Self::Target {
        // SAFETY: RepoPathBuf always contains a valid RepoPath.
        unsafe { RepoPath::from_bytes_unchecked(&self.inner) }
    }
}

impl AsRef<RepoPath> for RepoPathBuf {
    fn as_ref(&self) -> &RepoPath {
        self
    }
}

impl ToOwned for RepoPath {
    type Owned = RepoPathBuf;

    fn to_owned(&self) -> Self::Owned {
        RepoPathBuf {
            inner: self.inner.to_owned(),
        }
    }
}

impl Borrow<RepoPath> for RepoPathBuf {
    fn borrow(&self) -> &RepoPath {
        self
    }
}

impl From<&RepoPath> for RepoPathBuf {
    fn from(value: &RepoPath) -> Self {
        value.to_owned()
    }
}

impl FromStr for RepoPathBuf {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<RepoPathBuf, Self::Err> {
        Ok(RepoPath::from_bytes(s.as_bytes())
            .ok_or(std::io::ErrorKind::InvalidData)?
            .to_owned())
    }
}

impl Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl RepoPathBuf {
    pub fn new() -> RepoPathBuf {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> RepoPathBuf {
        // The empty path is a valid path.
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Adjoins `name` to self.
    pub fn try_push(&mut self, name: &[u8]) -> Result<(), std::io::Error> {
        if component::validate_name(name).is_err() {
            return Err(std::io::ErrorKind::InvalidData.into());
        }

        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }

        self.inner.extend_from_slice(name);

        Ok(())
    }

    /// Adjoins a validated [PathComponent] to self.
    pub fn push(&mut self, name: &PathComponent) {
        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }
        self.inner.extend_from_slice(name.as_ref());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner
    }
}

#[cfg(test)]
mod test {
    use super::{PathComponent, RepoPath, RepoPathBuf};
    use bstr::ByteSlice;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", 0)]
    #[case("a", 1)]
    #[case("a/b", 2)]
    #[case("a/b/c", 3)]
    pub fn from_str(#[case] s: &str, #[case] num_components: usize) {
        let p: RepoPathBuf = s.parse().expect("must parse");

        assert_eq!(s.as_bytes(), p.as_bytes(), "inner bytes mismatch");
        assert_eq!(
            num_components,
            p.components_bytes().count(),
            "number of components mismatch"
        );
    }

    #[rstest]
    #[case::absolute("/a/b")]
    #[case::two_forward_slashes_start("//a/b")]
    #[case::two_forward_slashes_middle("a/b//c/d")]
    #[case::trailing_slash("a/b/")]
    #[case::dot(".")]
    #[case::dotdot("..")]
    #[case::dot_middle("a/./b")]
    #[case::dotdot_middle("a/../b")]
    #[case::null("fo\0o")]
    pub fn from_str_fail(#[case] s: &str) {
        s.parse::<RepoPathBuf>().expect_err("must fail");
    }

    #[rstest]
    #[case("foo", "")]
    #[case("foo/bar", "foo")]
    #[case("foo/bar/baz", "foo/bar")]
    pub fn parent(#[case] p: RepoPathBuf, #[case] exp_parent: RepoPathBuf) {
        assert_eq!(Some(&*exp_parent), p.parent());
    }

    #[test]
    pub fn no_parent() {
        assert!(RepoPath::ROOT.parent().is_none());
    }

    #[rstest]
    #[case("a", "b", "a/b")]
    #[case("", "b", "b")]
    pub fn join_push(#[case] mut p: RepoPathBuf, #[case] name: &str, #[case] exp_p: RepoPathBuf) {
        assert_eq!(exp_p, p.try_join(name.as_bytes()).expect("join failed"));
        let component: PathComponent = name.try_into().expect("valid component");
        assert_eq!(exp_p, p.join(&component));
        p.try_push(name.as_bytes()).expect("push failed");
        assert_eq!(exp_p, p);
    }

    #[rstest]
    #[case("a", "/")]
    #[case("a", "")]
    #[case("a", "b/c")]
    #[case("", ".")]
    #[case("", "..")]
    pub fn join_push_fail(#[case] mut p: RepoPathBuf, #[case] name: &str) {
        p.try_join(name.as_bytes())
            .expect_err("join succeeded unexpectedly");
        p.try_push(name.as_bytes())
            .expect_err("push succeeded unexpectedly");
    }

    #[rstest]
    #[case::empty("", vec![])]
    #[case("a", vec!["a"])]
    #[case("a/b", vec!["a", "b"])]
    pub fn components_bytes(#[case] p: RepoPathBuf, #[case] exp_components: Vec<&str>) {
        assert_eq!(
            exp_components,
            p.components_bytes()
                .map(|x| x.to_str().unwrap())
                .collect::<Vec<_>>()
        );
    }
}
