//! Access control sheets and masks.
//!
//! Permissions form a closed enumeration. A sheet scopes a subset of
//! them for one account at one node: the `mask` says which permissions
//! the sheet defines, `perms` carries the granted value where the mask
//! is set. Undefined permissions inherit from the nearest ancestor
//! that defines them; the root carries a total default sheet.
use crate::account::AccountId;
use crate::error::{Error, RequestError};
use crate::xml::Element;

/// The permissions that can be granted or revoked per account and
/// node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum AclSetting {
    /// Create a subdirectory below the node.
    CanAddSubdirectory,
    /// Create a document below the node.
    CanAddDocument,
    /// Upload existing content into a new node below the node.
    CanSyncIn,
    /// Remove the node.
    CanRemoveNode,
    /// Explore the node's children.
    CanExploreNode,
    /// Subscribe to the server chat.
    CanSubscribeChat,
    /// Subscribe to the session at the node.
    CanSubscribeSession,
    /// Join a user into the session at the node.
    CanJoinUser,
    /// Query the account list.
    CanQueryAccountList,
    /// Create new accounts.
    CanCreateAccount,
    /// Remove accounts.
    CanRemoveAccount,
    /// Query the node's full ACL.
    CanQueryAcl,
    /// Change the node's ACL.
    CanSetAcl,
}

impl AclSetting {
    /// All settings, in bit order.
    pub const ALL: [AclSetting; 13] = [
        Self::CanAddSubdirectory,
        Self::CanAddDocument,
        Self::CanSyncIn,
        Self::CanRemoveNode,
        Self::CanExploreNode,
        Self::CanSubscribeChat,
        Self::CanSubscribeSession,
        Self::CanJoinUser,
        Self::CanQueryAccountList,
        Self::CanCreateAccount,
        Self::CanRemoveAccount,
        Self::CanQueryAcl,
        Self::CanSetAcl,
    ];

    /// The wire name of the setting.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CanAddSubdirectory => "can-add-subdirectory",
            Self::CanAddDocument => "can-add-document",
            Self::CanSyncIn => "can-sync-in",
            Self::CanRemoveNode => "can-remove-node",
            Self::CanExploreNode => "can-explore-node",
            Self::CanSubscribeChat => "can-subscribe-chat",
            Self::CanSubscribeSession => "can-subscribe-session",
            Self::CanJoinUser => "can-join-user",
            Self::CanQueryAccountList => "can-query-account-list",
            Self::CanCreateAccount => "can-create-account",
            Self::CanRemoveAccount => "can-remove-account",
            Self::CanQueryAcl => "can-query-acl",
            Self::CanSetAcl => "can-set-acl",
        }
    }

    /// Parses a wire name.
    pub fn from_str(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|setting| setting.as_str() == name)
    }
}

/// A 256 bit wide bitfield over [`AclSetting`]s.
///
/// The width leaves room for future settings without changing the wire
/// representation, which transfers names, not bit positions.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct AclMask([u64; 4]);

impl AclMask {
    /// The empty mask.
    pub const EMPTY: AclMask = AclMask([0; 4]);

    /// Returns a mask with the given settings set.
    pub fn of(settings: &[AclSetting]) -> Self {
        let mut mask = Self::EMPTY;
        for setting in settings {
            mask.set(*setting);
        }
        mask
    }

    /// Mask with every known setting set.
    pub fn all() -> Self {
        Self::of(&AclSetting::ALL)
    }

    /// The compiled-in permissions of an account nothing has been
    /// configured for: everything except account administration and
    /// ACL modification.
    pub fn default_perms() -> Self {
        let mut mask = Self::all();
        mask.clear(AclSetting::CanCreateAccount);
        mask.clear(AclSetting::CanRemoveAccount);
        mask.clear(AclSetting::CanSetAcl);
        mask
    }

    /// Returns whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0 == [0; 4]
    }

    /// Returns whether the bit for `setting` is set.
    pub fn has(&self, setting: AclSetting) -> bool {
        let bit = setting as usize;
        self.0[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Sets the bit for `setting`.
    pub fn set(&mut self, setting: AclSetting) {
        let bit = setting as usize;
        self.0[bit / 64] |= 1 << (bit % 64);
    }

    /// Clears the bit for `setting`.
    pub fn clear(&mut self, setting: AclSetting) {
        let bit = setting as usize;
        self.0[bit / 64] &= !(1 << (bit % 64));
    }

    /// Bitwise and.
    pub fn and(&self, other: &AclMask) -> AclMask {
        let mut out = [0; 4];
        for (index, slot) in out.iter_mut().enumerate() {
            *slot = self.0[index] & other.0[index];
        }
        AclMask(out)
    }

    /// Bitwise or.
    pub fn or(&self, other: &AclMask) -> AclMask {
        let mut out = [0; 4];
        for (index, slot) in out.iter_mut().enumerate() {
            *slot = self.0[index] | other.0[index];
        }
        AclMask(out)
    }

    /// The comma-separated wire form; ordering of names is
    /// irrelevant on decode.
    pub fn to_names(&self) -> String {
        let mut names = Vec::new();
        for setting in AclSetting::ALL {
            if self.has(setting) {
                names.push(setting.as_str());
            }
        }
        names.join(",")
    }

    /// Parses the comma-separated wire form. Unknown names fail so a
    /// sheet is never silently weakened.
    pub fn from_names(names: &str) -> Result<Self, Error> {
        let mut mask = Self::EMPTY;
        for name in names.split(',').filter(|name| !name.is_empty()) {
            let setting = AclSetting::from_str(name.trim())
                .ok_or_else(|| RequestError::Failed(format!("unknown permission {:?}", name)))?;
            mask.set(setting);
        }
        Ok(mask)
    }
}

/// The permissions one sheet defines for one account.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AclSheet {
    /// Which permissions this sheet defines.
    pub mask: AclMask,
    /// The granted value for every defined permission.
    pub perms: AclMask,
}

impl AclSheet {
    /// Returns the sheet's verdict on `setting`: `Some(granted)` when
    /// defined here, `None` when inherited.
    pub fn lookup(&self, setting: AclSetting) -> Option<bool> {
        if self.mask.has(setting) {
            Some(self.perms.has(setting))
        } else {
            None
        }
    }
}

/// The per-account sheets stored at one node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AclSheetSet {
    sheets: Vec<(AccountId, AclSheet)>,
}

impl AclSheetSet {
    /// Returns an empty sheet set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether no sheet is stored.
    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    /// The sheet for `account`, if one is stored.
    pub fn find(&self, account: &AccountId) -> Option<&AclSheet> {
        self.sheets
            .iter()
            .find(|(id, _)| id == account)
            .map(|(_, sheet)| sheet)
    }

    /// Inserts or replaces the sheet for `account`. A sheet with an
    /// empty mask removes the entry.
    pub fn insert(&mut self, account: AccountId, sheet: AclSheet) {
        self.sheets.retain(|(id, _)| *id != account);
        if !sheet.mask.is_empty() {
            self.sheets.push((account, sheet));
        }
    }

    /// Removes the sheet for `account`.
    pub fn remove(&mut self, account: &AccountId) {
        self.sheets.retain(|(id, _)| id != account);
    }

    /// Merges `other` into `self`: sheets of the same account are
    /// replaced, new accounts appended.
    pub fn merge(&mut self, other: &AclSheetSet) {
        for (account, sheet) in &other.sheets {
            self.insert(account.clone(), *sheet);
        }
    }

    /// Iterates over the stored sheets.
    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &AclSheet)> {
        self.sheets.iter().map(|(account, sheet)| (account, sheet))
    }

    /// Serialises the set as a sequence of `<sheet>` children on
    /// `parent`.
    pub fn to_xml(&self, mut parent: Element) -> Element {
        for (account, sheet) in &self.sheets {
            parent = parent.child(
                Element::new("sheet")
                    .attr("id", account.as_str())
                    .attr("mask", sheet.mask.to_names())
                    .attr("perms", sheet.perms.and(&sheet.mask).to_names()),
            );
        }
        parent
    }

    /// Parses the `<sheet>` children of `parent`.
    pub fn from_xml(parent: &Element) -> Result<Self, Error> {
        let mut set = Self::new();
        for sheet in parent.children_named("sheet") {
            let account = AccountId::new(sheet.required_attr("id")?);
            let mask = AclMask::from_names(sheet.required_attr("mask")?)?;
            let perms = AclMask::from_names(sheet.required_attr("perms")?)?;
            set.insert(
                account,
                AclSheet {
                    mask,
                    perms: perms.and(&mask),
                },
            );
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_only() -> AclSheet {
        AclSheet {
            mask: AclMask::all(),
            perms: AclMask::of(&[AclSetting::CanSubscribeSession]),
        }
    }

    #[test]
    fn mask_bits_are_independent() {
        let mut mask = AclMask::EMPTY;
        mask.set(AclSetting::CanSetAcl);
        assert!(mask.has(AclSetting::CanSetAcl));
        assert!(!mask.has(AclSetting::CanQueryAcl));
        mask.clear(AclSetting::CanSetAcl);
        assert!(mask.is_empty());
    }

    #[test]
    fn default_perms_exclude_administration() {
        let perms = AclMask::default_perms();
        assert!(perms.has(AclSetting::CanSubscribeSession));
        assert!(perms.has(AclSetting::CanExploreNode));
        assert!(!perms.has(AclSetting::CanSetAcl));
        assert!(!perms.has(AclSetting::CanCreateAccount));
    }

    #[test]
    fn name_roundtrip_ignores_order() {
        let mask = AclMask::of(&[AclSetting::CanJoinUser, AclSetting::CanExploreNode]);
        let parsed = AclMask::from_names("can-join-user,can-explore-node").unwrap();
        assert_eq!(mask, parsed);
        let reversed = AclMask::from_names("can-explore-node,can-join-user").unwrap();
        assert_eq!(mask, reversed);
        assert!(AclMask::from_names("can-fly").is_err());
    }

    #[test]
    fn sheet_lookup_distinguishes_undefined() {
        let sheet = subscribe_only();
        assert_eq!(sheet.lookup(AclSetting::CanSubscribeSession), Some(true));
        assert_eq!(sheet.lookup(AclSetting::CanSetAcl), Some(false));
        let partial = AclSheet {
            mask: AclMask::of(&[AclSetting::CanJoinUser]),
            perms: AclMask::EMPTY,
        };
        assert_eq!(partial.lookup(AclSetting::CanJoinUser), Some(false));
        assert_eq!(partial.lookup(AclSetting::CanSetAcl), None);
    }

    #[test]
    fn sheet_set_xml_roundtrip() {
        let mut set = AclSheetSet::new();
        set.insert(AccountId::default_account(), subscribe_only());
        set.insert(
            AccountId::new("alice"),
            AclSheet {
                mask: AclMask::of(&[AclSetting::CanSetAcl, AclSetting::CanQueryAcl]),
                perms: AclMask::of(&[AclSetting::CanQueryAcl]),
            },
        );
        let element = set.to_xml(Element::new("acl"));
        let parsed = AclSheetSet::from_xml(&element).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn empty_masked_sheet_is_dropped() {
        let mut set = AclSheetSet::new();
        set.insert(AccountId::new("alice"), AclSheet::default());
        assert!(set.is_empty());
    }
}
