// Response-code enums for every async api operation, plus the failure enums
// carried by fire-and-forget events.
//
// Every api family follows the same convention: `Success = 0`, then the four
// shared infrastructure codes (`NoResponseFromServer`, `DataCapReached`,
// `RateLimitExceeded`, `NoDatabase`), then operation-specific codes. The
// `response_codes!` macro bakes the shared prefix in so a family can never
// drift from the convention. All codes serialize as their numeric value —
// the numbers are the wire contract and must never change.
//
// Fire-and-forget failures (`ConnectError`, `LobbyCreateError`,
// `LobbyJoinError`, `CriticalError`) do not share the prefix; they are
// defined with the plain `wire_enum!` macro.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decode error for a numeric code outside a family's closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unknown {family} code {value}")]
pub struct UnknownCode {
    pub family: &'static str,
    pub value: u8,
}

/// The four infrastructure failures shared by every api response family,
/// plus success. Used by the server to answer any request with a shared
/// code without matching on the family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedCode {
    Success,
    NoResponseFromServer,
    DataCapReached,
    RateLimitExceeded,
    NoDatabase,
}

/// Defines a closed wire enum with explicit numeric discriminants,
/// serialized as its numeric value.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(into = "u8", try_from = "u8")]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl From<$name> for u8 {
            fn from(code: $name) -> u8 {
                code as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = UnknownCode;

            fn try_from(value: u8) -> Result<Self, UnknownCode> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(UnknownCode {
                        family: stringify!($name),
                        value: other,
                    }),
                }
            }
        }
    };
}

/// Defines an api response-code family: the shared prefix codes are inserted
/// automatically, operation-specific codes start at 5.
macro_rules! response_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),* $(,)? }) => {
        wire_enum! {
            $(#[$meta])*
            $name {
                Success = 0,
                NoResponseFromServer = 1,
                DataCapReached = 2,
                RateLimitExceeded = 3,
                NoDatabase = 4,
                $($variant = $value),*
            }
        }

        impl $name {
            /// Maps a shared infrastructure code into this family.
            pub fn shared(code: SharedCode) -> Self {
                match code {
                    SharedCode::Success => Self::Success,
                    SharedCode::NoResponseFromServer => Self::NoResponseFromServer,
                    SharedCode::DataCapReached => Self::DataCapReached,
                    SharedCode::RateLimitExceeded => Self::RateLimitExceeded,
                    SharedCode::NoDatabase => Self::NoDatabase,
                }
            }
        }
    };
}

wire_enum! {
    /// Why a connection attempt was refused.
    ConnectError {
        InvalidKey = 0,
        Timeout = 1,
    }
}

wire_enum! {
    /// Why a CreateLobby call failed (delivered via LobbyCreationFailed).
    LobbyCreateError {
        AlreadyExists = 0,
        NameTooShort = 1,
        NameTooLong = 2,
        PasswordTooLong = 3,
        TagsTooLarge = 4,
        DataTooLarge = 5,
        OnCooldown = 6,
    }
}

wire_enum! {
    /// Why a JoinLobby call failed (delivered via LobbyJoinFailed).
    LobbyJoinError {
        DoesNotExist = 0,
        Closed = 1,
        Full = 2,
        IncorrectPassword = 3,
        DuplicateUsername = 4,
    }
}

wire_enum! {
    /// Server-enforced capacity violations, reported out-of-band because they
    /// can occur independent of any single call site.
    CriticalError {
        LobbyDataFull = 0,
        LobbyTagsFull = 1,
        PlayerDataFull = 2,
        RequestTooLarge = 3,
    }
}

response_codes! {
    CreateAccountCode {
        StorageFull = 5,
        InvalidEmail = 6,
        InvalidUsername = 7,
        EmailAlreadyExists = 8,
        UsernameAlreadyExists = 9,
        UsernameTooShort = 10,
        UsernameTooLong = 11,
        PasswordTooShort = 12,
        PasswordTooLong = 13,
    }
}

response_codes! {
    DeleteAccountCode {
        EmailOrPasswordIncorrect = 5,
    }
}

response_codes! {
    ResendVerificationCode {
        VerificationDisabled = 5,
        OnCooldown = 6,
        AlreadyVerified = 7,
        EmailOrPasswordIncorrect = 8,
        Banned = 9,
    }
}

response_codes! {
    VerifyAccountCode {
        IncorrectCode = 5,
        CodeExpired = 6,
        AlreadyVerified = 7,
        Banned = 8,
    }
}

response_codes! {
    IsVerifiedCode {
        NotLoggedIn = 5,
        UserDoesntExist = 6,
    }
}

response_codes! {
    LoginCode {
        EmailOrPasswordIncorrect = 5,
        NotVerified = 6,
        ExpiredSession = 7,
        Banned = 8,
    }
}

response_codes! {
    LogoutCode {
        NotLoggedIn = 5,
    }
}

response_codes! {
    ChangePasswordCode {
        OnCooldown = 5,
        EmailOrPasswordIncorrect = 6,
        NotVerified = 7,
        Banned = 8,
    }
}

response_codes! {
    ChangeUsernameCode {
        NotLoggedIn = 5,
        OnCooldown = 6,
        UsernameAlreadyExists = 7,
        UsernameTooShort = 8,
        UsernameTooLong = 9,
        InvalidUsername = 10,
    }
}

response_codes! {
    ResetPasswordCode {
        EmailOrCodeIncorrect = 5,
        CodeExpired = 6,
    }
}

response_codes! {
    RequestPasswordResetCode {
        OnCooldown = 5,
        EmailDoesntExist = 6,
        Banned = 7,
    }
}

response_codes! {
    ReportUserCode {
        NotLoggedIn = 5,
        StorageFull = 6,
        ReportTooLong = 7,
        TooManyReports = 8,
        UserDoesntExist = 9,
    }
}

response_codes! {
    SetDocumentCode {
        NotLoggedIn = 5,
        StorageFull = 6,
    }
}

response_codes! {
    SetExternalVisibleCode {
        NotLoggedIn = 5,
        DoesntExist = 6,
    }
}

response_codes! {
    GetDocumentCode {
        NotLoggedIn = 5,
        DoesntExist = 6,
    }
}

response_codes! {
    HasDocumentCode {
        NotLoggedIn = 5,
    }
}

response_codes! {
    BrowseCollectionCode {
        NotLoggedIn = 5,
        DoesntExist = 6,
    }
}

response_codes! {
    DeleteDocumentCode {
        NotLoggedIn = 5,
        DoesntExist = 6,
    }
}

response_codes! {
    HasLeaderboardCode {
        NotLoggedIn = 5,
    }
}

response_codes! {
    GetLeaderboardsCode {
        NotLoggedIn = 5,
    }
}

response_codes! {
    BrowseLeaderboardCode {
        NotLoggedIn = 5,
        LeaderboardDoesntExist = 6,
    }
}

response_codes! {
    GetLeaderboardScoreCode {
        NotLoggedIn = 5,
        LeaderboardDoesntExist = 6,
        UserDoesntExist = 7,
    }
}

response_codes! {
    SubmitScoreCode {
        NotLoggedIn = 5,
        StorageFull = 6,
        LeaderboardDoesntExist = 7,
    }
}

response_codes! {
    DeleteScoreCode {
        NotLoggedIn = 5,
        LeaderboardDoesntExist = 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_zero_in_every_family() {
        assert_eq!(u8::from(CreateAccountCode::Success), 0);
        assert_eq!(u8::from(DeleteAccountCode::Success), 0);
        assert_eq!(u8::from(VerifyAccountCode::Success), 0);
        assert_eq!(u8::from(LoginCode::Success), 0);
        assert_eq!(u8::from(LogoutCode::Success), 0);
        assert_eq!(u8::from(SetDocumentCode::Success), 0);
        assert_eq!(u8::from(GetDocumentCode::Success), 0);
        assert_eq!(u8::from(BrowseLeaderboardCode::Success), 0);
        assert_eq!(u8::from(SubmitScoreCode::Success), 0);
    }

    #[test]
    fn shared_prefix_is_uniform() {
        assert_eq!(u8::from(CreateAccountCode::NoResponseFromServer), 1);
        assert_eq!(u8::from(CreateAccountCode::DataCapReached), 2);
        assert_eq!(u8::from(CreateAccountCode::RateLimitExceeded), 3);
        assert_eq!(u8::from(CreateAccountCode::NoDatabase), 4);
        assert_eq!(u8::from(SubmitScoreCode::NoResponseFromServer), 1);
        assert_eq!(u8::from(SubmitScoreCode::DataCapReached), 2);
        assert_eq!(u8::from(SubmitScoreCode::RateLimitExceeded), 3);
        assert_eq!(u8::from(SubmitScoreCode::NoDatabase), 4);
    }

    #[test]
    fn operation_specific_codes_start_at_five() {
        assert_eq!(u8::from(CreateAccountCode::StorageFull), 5);
        assert_eq!(u8::from(CreateAccountCode::PasswordTooLong), 13);
        assert_eq!(u8::from(LoginCode::EmailOrPasswordIncorrect), 5);
        assert_eq!(u8::from(LoginCode::Banned), 8);
        assert_eq!(u8::from(ChangeUsernameCode::InvalidUsername), 10);
        assert_eq!(u8::from(GetLeaderboardScoreCode::UserDoesntExist), 7);
    }

    #[test]
    fn shared_maps_into_family() {
        assert_eq!(
            LoginCode::shared(SharedCode::RateLimitExceeded),
            LoginCode::RateLimitExceeded
        );
        assert_eq!(
            DeleteScoreCode::shared(SharedCode::NoDatabase),
            DeleteScoreCode::NoDatabase
        );
        assert_eq!(LogoutCode::shared(SharedCode::Success), LogoutCode::Success);
    }

    #[test]
    fn codes_serialize_as_numbers() {
        let json = serde_json::to_string(&LoginCode::NotVerified).unwrap();
        assert_eq!(json, "6");
        let back: LoginCode = serde_json::from_str("6").unwrap();
        assert_eq!(back, LoginCode::NotVerified);
    }

    #[test]
    fn unknown_code_is_rejected() {
        let err = serde_json::from_str::<LogoutCode>("200");
        assert!(err.is_err());
        assert_eq!(
            LobbyJoinError::try_from(99),
            Err(UnknownCode {
                family: "LobbyJoinError",
                value: 99
            })
        );
    }

    #[test]
    fn lobby_error_discriminants_are_stable() {
        assert_eq!(u8::from(LobbyCreateError::AlreadyExists), 0);
        assert_eq!(u8::from(LobbyCreateError::OnCooldown), 6);
        assert_eq!(u8::from(LobbyJoinError::DoesNotExist), 0);
        assert_eq!(u8::from(LobbyJoinError::DuplicateUsername), 4);
        assert_eq!(u8::from(CriticalError::LobbyDataFull), 0);
        assert_eq!(u8::from(CriticalError::RequestTooLarge), 3);
        assert_eq!(u8::from(ConnectError::InvalidKey), 0);
        assert_eq!(u8::from(ConnectError::Timeout), 1);
    }
}
