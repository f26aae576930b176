//! Structural Diff / Patch
//!
//! Computes minimal changesets between two versions of a value and applies
//! them back. `None` plays the role of NO_DIFF everywhere: no application
//! value can ever be mistaken for it.
//!
//! | Shape        | Changeset                         | Rule                                  |
//! |--------------|-----------------------------------|---------------------------------------|
//! | primitive    | new value                         | equality                              |
//! | `Option<T>`  | [`OptionDiff`]                    | presence change replaces wholesale    |
//! | `Vec<T>`     | [`ArrayDiff`]                     | per-index patch, tail insert/truncate |
//! | object       | generated by [`sync_object!`]     | collapses when every field is `None`  |
//!
//! Round-trip law: `prev.patch(curr.diff(&prev))` leaves `prev == curr`.
//!
//! [`sync_object!`]: crate::sync_object

use std::fmt;

use super::codec::{CodecError, CodecResult, Decode, Encode, Reader, Writer};

/// A value that can describe and apply its own changes.
pub trait Diffable: Encode + Decode + Clone + PartialEq + fmt::Debug {
    /// Changeset type.
    type Diff: Encode + Decode + Clone + PartialEq + fmt::Debug;

    /// Changes needed to turn `previous` into `self`, or `None` if equal.
    fn diff(&self, previous: &Self) -> Option<Self::Diff>;

    /// Apply a changeset produced by [`Diffable::diff`] against this value.
    fn patch(&mut self, diff: Self::Diff);
}

/// Changeset for a value the client has never seen.
///
/// A fresh subscriber starts from `T::default()`, so the first update is an
/// ordinary diff against it.
pub fn changeset_since<T: Diffable + Default>(current: &T, previous: Option<&T>) -> Option<T::Diff> {
    match previous {
        Some(previous) => current.diff(previous),
        None => current.diff(&T::default()),
    }
}

/// Implement [`Diffable`] for types compared by value equality.
///
/// The type must already implement `Encode`, `Decode`, `Clone`, `PartialEq`
/// and `Debug`.
#[macro_export]
macro_rules! impl_value_diff {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::core::diff::Diffable for $ty {
                type Diff = $ty;

                fn diff(&self, previous: &Self) -> Option<$ty> {
                    if self == previous {
                        None
                    } else {
                        Some(self.clone())
                    }
                }

                fn patch(&mut self, diff: $ty) {
                    *self = diff;
                }
            }
        )+
    };
}

impl_value_diff!(bool, u8, u32, u64, i32, i64, String);

// Compared by bit pattern, so NaN == NaN and 0.0 != -0.0
impl Diffable for f32 {
    type Diff = f32;

    fn diff(&self, previous: &Self) -> Option<f32> {
        (self.to_bits() != previous.to_bits()).then_some(*self)
    }

    fn patch(&mut self, diff: f32) {
        *self = diff;
    }
}

/// Declare a struct that diffs field by field, together with its changeset.
///
/// ```
/// statesync::sync_object! {
///     /// A scoreboard row.
///     #[derive(Default)]
///     pub struct Row => RowDiff {
///         /// Display name.
///         pub name: String,
///         /// Points.
///         pub score: i32,
///     }
/// }
///
/// use statesync::core::diff::Diffable;
/// let before = Row { name: "ada".into(), score: 1 };
/// let after = Row { name: "ada".into(), score: 2 };
/// let diff = after.diff(&before).unwrap();
/// assert_eq!(diff.name, None);
/// assert_eq!(diff.score, Some(2));
/// ```
///
/// Encoding: every field in order. Changeset encoding: one presence bit per
/// field, then the present fields' changesets.
#[macro_export]
macro_rules! sync_object {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident => $diff:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )+
        }

        #[doc = concat!("Changeset for [`", stringify!($name), "`]; `None` fields are unchanged.")]
        #[derive(Debug, Clone, PartialEq, Default)]
        $vis struct $diff {
            $(
                $(#[$fmeta])*
                $fvis $field: Option<<$ty as $crate::core::diff::Diffable>::Diff>,
            )+
        }

        impl $crate::core::codec::Encode for $name {
            fn encode(&self, writer: &mut $crate::core::codec::Writer) {
                $( $crate::core::codec::Encode::encode(&self.$field, writer); )+
            }
        }

        impl $crate::core::codec::Decode for $name {
            fn decode(
                reader: &mut $crate::core::codec::Reader<'_>,
            ) -> $crate::core::codec::CodecResult<Self> {
                Ok(Self {
                    $( $field: $crate::core::codec::Decode::decode(reader)?, )+
                })
            }
        }

        impl $crate::core::codec::Encode for $diff {
            fn encode(&self, writer: &mut $crate::core::codec::Writer) {
                $( writer.write_bit(self.$field.is_some()); )+
                $(
                    if let Some(change) = &self.$field {
                        $crate::core::codec::Encode::encode(change, writer);
                    }
                )+
            }
        }

        impl $crate::core::codec::Decode for $diff {
            fn decode(
                reader: &mut $crate::core::codec::Reader<'_>,
            ) -> $crate::core::codec::CodecResult<Self> {
                $( let $field = reader.read_bit()?; )+
                Ok(Self {
                    $(
                        $field: if $field {
                            Some($crate::core::codec::Decode::decode(reader)?)
                        } else {
                            None
                        },
                    )+
                })
            }
        }

        impl $crate::core::diff::Diffable for $name {
            type Diff = $diff;

            fn diff(&self, previous: &Self) -> Option<$diff> {
                let diff = $diff {
                    $( $field: $crate::core::diff::Diffable::diff(&self.$field, &previous.$field), )+
                };
                if $( diff.$field.is_none() )&&+ {
                    None
                } else {
                    Some(diff)
                }
            }

            fn patch(&mut self, diff: $diff) {
                $(
                    if let Some(change) = diff.$field {
                        $crate::core::diff::Diffable::patch(&mut self.$field, change);
                    }
                )+
            }
        }
    };
}

// =============================================================================
// OPTIONAL FIELDS
// =============================================================================

/// Changeset for an optional field.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionDiff<T: Diffable> {
    /// Presence changed; carry the whole new value.
    Replace(Option<T>),
    /// Present on both sides; carry the inner changeset.
    Patch(T::Diff),
}

impl<T: Diffable> Diffable for Option<T> {
    type Diff = OptionDiff<T>;

    fn diff(&self, previous: &Self) -> Option<OptionDiff<T>> {
        match (self, previous) {
            (None, None) => None,
            (Some(current), Some(previous)) => current.diff(previous).map(OptionDiff::Patch),
            _ => Some(OptionDiff::Replace(self.clone())),
        }
    }

    fn patch(&mut self, diff: OptionDiff<T>) {
        match diff {
            OptionDiff::Replace(value) => *self = value,
            OptionDiff::Patch(change) => {
                if let Some(inner) = self {
                    inner.patch(change);
                }
            }
        }
    }
}

impl<T: Diffable> Encode for OptionDiff<T> {
    fn encode(&self, writer: &mut Writer) {
        match self {
            OptionDiff::Replace(value) => {
                writer.write_bit(false);
                value.encode(writer);
            }
            OptionDiff::Patch(change) => {
                writer.write_bit(true);
                change.encode(writer);
            }
        }
    }
}

impl<T: Diffable> Decode for OptionDiff<T> {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        if reader.read_bit()? {
            Ok(OptionDiff::Patch(T::Diff::decode(reader)?))
        } else {
            Ok(OptionDiff::Replace(Option::<T>::decode(reader)?))
        }
    }
}

// =============================================================================
// ARRAYS
// =============================================================================

/// Changeset for an array.
///
/// `patches` covers the prefix both versions share; `inserts` are the new
/// elements past the previous length. `len` shorter than the previous length
/// truncates.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDiff<T: Diffable> {
    /// Length after patching.
    pub len: usize,
    /// Per-index changesets for the shared prefix.
    pub patches: Vec<Option<T::Diff>>,
    /// Elements appended past the previous length.
    pub inserts: Vec<T>,
}

impl<T: Diffable> Diffable for Vec<T> {
    type Diff = ArrayDiff<T>;

    fn diff(&self, previous: &Self) -> Option<ArrayDiff<T>> {
        let common = self.len().min(previous.len());
        let patches: Vec<Option<T::Diff>> = self[..common]
            .iter()
            .zip(&previous[..common])
            .map(|(current, previous)| current.diff(previous))
            .collect();

        if self.len() == previous.len() && patches.iter().all(Option::is_none) {
            return None;
        }

        Some(ArrayDiff {
            len: self.len(),
            patches,
            inserts: self[common..].to_vec(),
        })
    }

    fn patch(&mut self, diff: ArrayDiff<T>) {
        self.truncate(diff.len);
        for (item, change) in self.iter_mut().zip(diff.patches) {
            if let Some(change) = change {
                item.patch(change);
            }
        }
        self.extend(diff.inserts);
    }
}

impl<T: Diffable> Encode for ArrayDiff<T> {
    fn encode(&self, writer: &mut Writer) {
        writer.write_uvarint(self.len as u64);
        writer.write_uvarint(self.patches.len() as u64);
        for change in &self.patches {
            writer.write_bit(change.is_some());
        }
        for change in self.patches.iter().flatten() {
            change.encode(writer);
        }
        for item in &self.inserts {
            item.encode(writer);
        }
    }
}

impl<T: Diffable> Decode for ArrayDiff<T> {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let len = reader.read_len()?;
        let common = reader.read_len()?;
        if common > len {
            return Err(CodecError::OutOfRange {
                kind: "array diff prefix",
                value: common as i128,
            });
        }

        let mut present = Vec::with_capacity(common.min(reader.remaining() + 1));
        for _ in 0..common {
            present.push(reader.read_bit()?);
        }
        let mut patches = Vec::with_capacity(present.len());
        for is_present in present {
            patches.push(if is_present {
                Some(T::Diff::decode(reader)?)
            } else {
                None
            });
        }

        let mut inserts = Vec::with_capacity((len - common).min(reader.remaining() + 1));
        for _ in common..len {
            inserts.push(T::decode(reader)?);
        }

        Ok(ArrayDiff { len, patches, inserts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{decode_from_slice, encode_to_vec};
    use proptest::prelude::*;

    crate::sync_object! {
        #[derive(Default)]
        struct Card => CardDiff {
            rank: u8,
            face_up: bool,
        }
    }

    crate::sync_object! {
        #[derive(Default)]
        struct Table => TableDiff {
            name: String,
            pot: i64,
            dealer: Option<String>,
            hands: Vec<Vec<Card>>,
            spotlight: Option<Card>,
        }
    }

    fn wire<T: Diffable>(diff: &T::Diff) -> T::Diff {
        decode_from_slice::<T::Diff>(&encode_to_vec(diff)).unwrap()
    }

    #[test]
    fn test_primitive_diff() {
        assert_eq!(5i64.diff(&5), None);
        assert_eq!(6i64.diff(&5), Some(6));
        assert_eq!("b".to_string().diff(&"a".to_string()), Some("b".to_string()));
    }

    #[test]
    fn test_float_diff_by_bits() {
        assert_eq!(f32::NAN.diff(&f32::NAN), None);
        assert_eq!(vec![1.0f32, f32::NAN].diff(&vec![1.0, f32::NAN]), None);
        assert_eq!((-0.0f32).diff(&0.0), Some(-0.0));
        assert_eq!(1.5f32.diff(&1.5), None);
    }

    #[test]
    fn test_array_truncation() {
        let previous = vec![1i32, 2, 3, 4, 5];
        let current = vec![1i32, 2, 3];
        let diff = current.diff(&previous).unwrap();
        assert_eq!(diff.len, 3);
        assert_eq!(diff.patches, vec![None, None, None]);
        assert!(diff.inserts.is_empty());

        let mut patched = previous.clone();
        patched.patch(wire::<Vec<i32>>(&diff));
        assert_eq!(patched, current);
    }

    #[test]
    fn test_array_insertion_is_wholesale() {
        let previous = vec![1i32, 2, 3];
        let current = vec![1i32, 2, 3, 9];
        let diff = current.diff(&previous).unwrap();
        assert_eq!(diff.len, 4);
        assert_eq!(diff.patches, vec![None, None, None]);
        assert_eq!(diff.inserts, vec![9]);

        let mut patched = previous;
        patched.patch(diff);
        assert_eq!(patched, current);
    }

    #[test]
    fn test_array_patches_changed_indices_only() {
        let previous = vec!["a".to_string(), "b".to_string()];
        let current = vec!["a".to_string(), "c".to_string()];
        let diff = current.diff(&previous).unwrap();
        assert_eq!(diff.patches, vec![None, Some("c".to_string())]);
    }

    #[test]
    fn test_option_three_way() {
        let none: Option<Card> = None;
        let some = Some(Card { rank: 3, face_up: false });
        let flipped = Some(Card { rank: 3, face_up: true });

        assert_eq!(none.diff(&None), None);
        assert_eq!(some.diff(&none), Some(OptionDiff::Replace(some.clone())));
        assert_eq!(none.diff(&some), Some(OptionDiff::Replace(None)));
        assert_eq!(
            flipped.diff(&some),
            Some(OptionDiff::Patch(CardDiff { rank: None, face_up: Some(true) }))
        );
    }

    #[test]
    fn test_object_collapses_when_unchanged() {
        let table = Table {
            name: "main".into(),
            pot: 40,
            dealer: Some("ada".into()),
            hands: vec![vec![Card { rank: 1, face_up: true }]],
            spotlight: None,
        };
        assert_eq!(table.diff(&table.clone()), None);

        let mut changed = table.clone();
        changed.pot = 50;
        let diff = changed.diff(&table).unwrap();
        assert_eq!(diff, TableDiff { pot: Some(50), ..Default::default() });
    }

    #[test]
    fn test_changeset_since_default() {
        let table = Table {
            name: "t".into(),
            hands: vec![vec![]],
            ..Default::default()
        };
        let diff = changeset_since(&table, None).unwrap();
        let mut fresh = Table::default();
        fresh.patch(wire::<Table>(&diff));
        assert_eq!(fresh, table);

        assert_eq!(changeset_since(&Table::default(), None), None);
        assert_eq!(changeset_since(&table, Some(&table)), None);
    }

    #[test]
    fn test_diff_decode_rejects_bad_prefix() {
        let mut writer = Writer::new();
        writer.write_uvarint(1).write_uvarint(2);
        let bytes = writer.finish();
        assert!(decode_from_slice::<ArrayDiff<i32>>(&bytes).is_err());
    }

    fn card() -> impl Strategy<Value = Card> {
        (0u8..14, any::<bool>()).prop_map(|(rank, face_up)| Card { rank, face_up })
    }

    fn table() -> impl Strategy<Value = Table> {
        (
            "[a-z]{0,4}",
            -3i64..3,
            proptest::option::of("[a-z]{0,3}"),
            proptest::collection::vec(proptest::collection::vec(card(), 0..4), 0..4),
            proptest::option::of(card()),
        )
            .prop_map(|(name, pot, dealer, hands, spotlight)| Table {
                name,
                pot,
                dealer,
                hands,
                spotlight,
            })
    }

    proptest! {
        #[test]
        fn prop_patch_diff_roundtrip(previous in table(), current in table()) {
            let mut patched = previous.clone();
            if let Some(diff) = current.diff(&previous) {
                patched.patch(wire::<Table>(&diff));
            }
            prop_assert_eq!(patched, current);
        }

        #[test]
        fn prop_self_diff_is_empty(value in table()) {
            prop_assert_eq!(value.diff(&value), None);
        }

        #[test]
        fn prop_nested_vec_roundtrip(
            previous in proptest::collection::vec(proptest::option::of(-5i32..5), 0..8),
            current in proptest::collection::vec(proptest::option::of(-5i32..5), 0..8),
        ) {
            let mut patched = previous.clone();
            if let Some(diff) = current.diff(&previous) {
                patched.patch(wire::<Vec<Option<i32>>>(&diff));
            }
            prop_assert_eq!(patched, current);
        }
    }
}
