use tokio::io::{AsyncRead, AsyncWrite};

/// Shuttles bytes both ways between two duplex streams until either side
/// reaches EOF or fails, then returns, dropping whatever is left of both.
/// The teardown is symmetric: one side going away always tears down the
/// other.
pub async fn splice<A, B>(a: A, b: B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        forward = tokio::io::copy(&mut a_read, &mut b_write) => forward.map(|_| ()),
        backward = tokio::io::copy(&mut b_read, &mut a_write) => backward.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::splice;

    #[tokio::test]
    async fn forwards_bytes_in_both_directions() {
        let (mut near, far) = duplex(64);
        let (inner, mut outer) = duplex(64);

        let bridge = tokio::spawn(splice(far, inner));

        near.write_all(b"ping").await.unwrap();
        let mut buffer = [0u8; 4];
        outer.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"ping");

        outer.write_all(b"pong").await.unwrap();
        near.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"pong");

        drop(near);
        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_one_side_tears_down_the_other() {
        let (near, far) = duplex(64);
        let (inner, mut outer) = duplex(64);

        let bridge = tokio::spawn(splice(far, inner));

        drop(near);
        bridge.await.unwrap().unwrap();

        let mut buffer = [0u8; 1];
        let n = outer.read(&mut buffer).await.unwrap();
        assert_eq!(n, 0);
    }
}
