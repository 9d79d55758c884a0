use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

// This module contains the newtype names used to address nodes of a
// loaded manifest. Wrapping them keeps dataset names, model names and
// property places from being confused at call sites.

// TOKEN_CHAR is a single name component character: Unicode letters and
// numbers plus a restricted set of punctuation.
const TOKEN_CHAR: &'static str = r"\p{Letter}\p{Number}\-_";

lazy_static! {
    static ref TOKEN: String = ["[", TOKEN_CHAR, "]+"].concat();
    // MODEL_NAME_RE is one or more TOKEN components joined by '/'.
    // It may not begin or end in a '/'.
    static ref MODEL_NAME_RE: Regex =
        Regex::new(&["^", &TOKEN, "(/", &TOKEN, ")*$"].concat()).unwrap();
    // PLACE_RE is one or more TOKEN components joined by '.'.
    static ref PLACE_RE: Regex =
        Regex::new(&["^", &TOKEN, r"(\.", &TOKEN, ")*$"].concat()).unwrap();
}

macro_rules! name_types {
    (
        $(#[$outer:meta])*
        $vis:vis struct $Wrapper:ident(pattern = $Regex:ident);

        $($rest:tt)*
    ) => {
        $(#[$outer])*
        #[derive(
            Serialize, Deserialize, Default, Debug, Clone,
            PartialEq, Eq, PartialOrd, Ord, Hash,
        )]
        pub struct $Wrapper(String);

        impl $Wrapper {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
            pub fn regex() -> &'static Regex {
                &$Regex
            }
            pub fn is_valid(&self) -> bool {
                $Regex.is_match(&self.0)
            }
        }

        impl std::ops::Deref for $Wrapper {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $Wrapper {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$Wrapper> for String {
            fn from(w: $Wrapper) -> String {
                w.0
            }
        }

        impl fmt::Display for $Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_ref())
            }
        }

        name_types! {
            $($rest)*
        }
    };

    () => {};
}

name_types! {
    /// Dataset names are paths of tokens separated by '/', and may not
    /// begin or end in a '/': `datasets/gov/example`.
    pub struct DatasetName(pattern = MODEL_NAME_RE);

    /// Model names are paths of tokens separated by '/'. A model owned
    /// by a dataset is addressed by the dataset path plus the model
    /// token: `datasets/gov/example/country`.
    pub struct ModelName(pattern = MODEL_NAME_RE);

    /// A property place is the dotted path from the model root to a
    /// (possibly nested) property: `notes.note`.
    pub struct PropertyPlace(pattern = PLACE_RE);
}
