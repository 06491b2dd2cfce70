// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// The role an endpoint plays in a connection
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    #[inline]
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }
}
